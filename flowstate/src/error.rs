use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowstateError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema violation at '{path}': expected {expected}, got {found}")]
    UnexpectedType {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Schema violation at '{path}': required property '{property}' is missing")]
    RequiredProperty { path: String, property: String },

    #[error("Schema violation at '{path}': unexpected property '{property}' (additional_properties is false)")]
    AdditionalProperty { path: String, property: String },

    #[error("Schema violation at '{path}': duplicate item (unique_items is true)")]
    DuplicateItem { path: String },

    #[error("Collection '{name}' not found in schema")]
    UnknownCollection { name: String },

    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Update position '{position}' does not resolve to an array in {collection}/{id}")]
    InvalidUpdateTarget {
        collection: String,
        id: String,
        position: String,
    },

    #[error("Update on '{collection}' is missing a position")]
    MissingUpdatePosition { collection: String },

    #[error("Invalid document id: {0}")]
    InvalidId(String),

    #[error("Sequence not found: {id}")]
    SequenceNotFound { id: String },

    #[error("Block not found: {id}")]
    BlockNotFound { id: String },

    #[error("Action method not registered: {method}")]
    MethodNotFound { method: String },

    #[error("Action method '{method}' failed in block '{block_id}': {source}")]
    ActionFailure {
        block_id: String,
        method: String,
        #[source]
        source: Box<FlowstateError>,
    },

    #[error("Condition operands must be separated by an andOr operator")]
    MissingConditionOperator,

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowstateError {
    /// Stable machine-readable code for each error kind, usable by
    /// collaborators that match on errors across a process boundary.
    pub fn code(&self) -> &'static str {
        match self {
            FlowstateError::Schema(_) => "SCHEMA",
            FlowstateError::UnexpectedType { .. } => "SCHEMA_TYPE",
            FlowstateError::RequiredProperty { .. } => "SCHEMA_REQUIRED",
            FlowstateError::AdditionalProperty { .. } => "SCHEMA_ADDITIONAL",
            FlowstateError::DuplicateItem { .. } => "SCHEMA_UNIQUE",
            FlowstateError::UnknownCollection { .. } => "STORE_COLLECTION",
            FlowstateError::NotFound { .. } => "STORE_NOT_FOUND",
            FlowstateError::InvalidUpdateTarget { .. } => "STORE_UPDATE_TARGET",
            FlowstateError::MissingUpdatePosition { .. } => "STORE_UPDATE_POSITION",
            FlowstateError::InvalidId(_) => "STORE_ID",
            FlowstateError::SequenceNotFound { .. } => "ACTION_SEQUENCE",
            FlowstateError::BlockNotFound { .. } => "ACTION_BLOCK",
            FlowstateError::MethodNotFound { .. } => "ACTION_METHOD",
            FlowstateError::ActionFailure { .. } => "ACTION_FAILURE",
            FlowstateError::MissingConditionOperator => "ACTION_CONDITION",
            FlowstateError::Yaml(_) => "YAML",
            FlowstateError::Json(_) => "JSON",
            FlowstateError::Other(_) => "OTHER",
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowstateError>;
