//! Process definitions: model, parsing, validation and caching

mod cache;
mod duration;
mod model;
mod parse;

pub use cache::DefinitionCache;
pub use duration::parse_duration;
pub use model::{
    Element, ElementKind, FormEnumValue, FormProperty, ProcessDefinitionModel, ProcessModel,
    SequenceFlow, UserTaskDefinition,
};
pub use parse::{
    parse_definition, validate, ParseHandler, ParseOptions, SourceFormat, SAFE_MAX_ELEMENTS,
    SAFE_MAX_SOURCE_BYTES,
};

/// Errors raised while parsing or validating a definition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DefinitionError {
    #[error("cannot parse definition: {0}")]
    Syntax(String),

    #[error("unsupported resource type: {0}")]
    UnsupportedResource(String),

    #[error("definition is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("definition has {count} elements, limit is {limit}")]
    TooManyElements { count: usize, limit: usize },

    #[error("duplicate id '{0}'")]
    DuplicateId(String),

    #[error("definition has no start event")]
    MissingStartEvent,

    #[error("definition has more than one start event")]
    MultipleStartEvents,

    #[error("definition has no end event")]
    MissingEndEvent,

    #[error("flow '{flow}' references unknown element '{element}'")]
    UnknownFlowReference { flow: String, element: String },

    #[error("flow '{0}' targets the start event")]
    IncomingToStart(String),

    #[error("flow '{0}' leaves an end event")]
    OutgoingFromEnd(String),

    #[error("element '{0}' has no outgoing flow")]
    NoOutgoingFlows(String),

    #[error("default flow '{flow}' of gateway '{gateway}' must be an unconditional outgoing flow")]
    InvalidDefault { gateway: String, flow: String },

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("element '{element}': {message}")]
    Invalid { element: String, message: String },

    #[error("parse handler rejected definition: {0}")]
    Handler(String),
}
