pub mod schema;
pub mod document;
pub mod relation;
pub mod validation;
pub mod query;
pub mod event;
pub mod store;
pub mod action;
pub mod error;
mod util;

pub use action::{ActionEngine, ActionMethod, DispatchRequest, DocumentLoader, MethodArgs};
pub use error::{FlowstateError, Result};
pub use event::{AddListener, DataEvent, EventKind, ListenerHandle, Notify};
pub use query::{Condition, Op, Where};
pub use schema::{SchemaDefinition, SchemaRegistry};
pub use store::{
    DataValue, DeleteOptions, DeleteResult, ExpandEntry, FindOptions, GetOptions, GetResult,
    SetOptions, SetResult, Store, UpdateMethod, UpdateSpec,
};
