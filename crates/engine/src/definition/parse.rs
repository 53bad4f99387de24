//! Parsing and validation of deployment resources

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::duration::parse_duration;
use super::model::{ElementKind, ProcessDefinitionModel, ProcessModel};
use super::DefinitionError;

/// Upper bound on resource size in safe parsing mode
pub const SAFE_MAX_SOURCE_BYTES: usize = 1024 * 1024;

/// Upper bound on element plus flow count in safe parsing mode
pub const SAFE_MAX_ELEMENTS: usize = 2_000;

/// Resource encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Yaml,
    Json,
}

impl SourceFormat {
    /// Pick the format from a resource name's extension
    pub fn from_resource_name(name: &str) -> Result<Self, DefinitionError> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            Ok(Self::Yaml)
        } else if lower.ends_with(".json") {
            Ok(Self::Json)
        } else {
            Err(DefinitionError::UnsupportedResource(name.to_string()))
        }
    }
}

/// Hook into definition parsing
///
/// Handlers in the pre-parse list see the raw model before validation and may
/// rewrite it; handlers in the post-parse list see the validated model and may
/// reject it.
pub trait ParseHandler: Send + Sync + 'static {
    fn pre_parse(&self, _model: &mut ProcessDefinitionModel) -> Result<(), DefinitionError> {
        Ok(())
    }

    fn post_parse(&self, _model: &ProcessModel) -> Result<(), DefinitionError> {
        Ok(())
    }
}

/// Options applied to every parse
#[derive(Clone, Default)]
pub struct ParseOptions {
    /// Enforce the size limits below
    pub safe: bool,
    pub max_source_bytes: usize,
    pub max_elements: usize,
    pub pre_parse_handlers: Vec<Arc<dyn ParseHandler>>,
    pub post_parse_handlers: Vec<Arc<dyn ParseHandler>>,
}

impl ParseOptions {
    /// Safe parsing with the default limits
    pub fn safe() -> Self {
        Self {
            safe: true,
            max_source_bytes: SAFE_MAX_SOURCE_BYTES,
            max_elements: SAFE_MAX_ELEMENTS,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for ParseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseOptions")
            .field("safe", &self.safe)
            .field("max_source_bytes", &self.max_source_bytes)
            .field("max_elements", &self.max_elements)
            .field("pre_parse_handlers", &self.pre_parse_handlers.len())
            .field("post_parse_handlers", &self.post_parse_handlers.len())
            .finish()
    }
}

/// Parse, run handlers, and validate a definition resource
pub fn parse_definition(
    source: &str,
    format: SourceFormat,
    options: &ParseOptions,
) -> Result<ProcessModel, DefinitionError> {
    if options.safe && source.len() > options.max_source_bytes {
        return Err(DefinitionError::TooLarge {
            size: source.len(),
            limit: options.max_source_bytes,
        });
    }

    let mut model: ProcessDefinitionModel = match format {
        SourceFormat::Yaml => {
            serde_yaml::from_str(source).map_err(|e| DefinitionError::Syntax(e.to_string()))?
        }
        SourceFormat::Json => {
            serde_json::from_str(source).map_err(|e| DefinitionError::Syntax(e.to_string()))?
        }
    };

    if options.safe {
        let count = model.elements.len() + model.flows.len();
        if count > options.max_elements {
            return Err(DefinitionError::TooManyElements {
                count,
                limit: options.max_elements,
            });
        }
    }

    for handler in &options.pre_parse_handlers {
        handler.pre_parse(&mut model)?;
    }

    let validated = validate(model)?;

    for handler in &options.post_parse_handlers {
        handler.post_parse(&validated)?;
    }

    debug!(
        key = validated.key(),
        elements = validated.elements().len(),
        flows = validated.flows().len(),
        "parsed process definition"
    );
    Ok(validated)
}

/// Check structural rules and build the indexed model
pub fn validate(model: ProcessDefinitionModel) -> Result<ProcessModel, DefinitionError> {
    if model.key.trim().is_empty() {
        return Err(DefinitionError::Invalid {
            element: "<process>".into(),
            message: "key must not be empty".into(),
        });
    }

    let mut ids = HashSet::new();
    for id in model
        .elements
        .iter()
        .map(|e| &e.id)
        .chain(model.flows.iter().map(|f| &f.id))
    {
        if !ids.insert(id.as_str()) {
            return Err(DefinitionError::DuplicateId(id.clone()));
        }
    }

    let starts: Vec<usize> = model
        .elements
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e.kind, ElementKind::StartEvent { .. }))
        .map(|(i, _)| i)
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(DefinitionError::MissingStartEvent),
        [single] => *single,
        _ => return Err(DefinitionError::MultipleStartEvents),
    };
    if !model
        .elements
        .iter()
        .any(|e| matches!(e.kind, ElementKind::EndEvent))
    {
        return Err(DefinitionError::MissingEndEvent);
    }

    let element_kind = |id: &str| {
        model
            .elements
            .iter()
            .find(|e| e.id == id)
            .map(|e| &e.kind)
    };

    for flow in &model.flows {
        for endpoint in [&flow.source, &flow.target] {
            if element_kind(endpoint).is_none() {
                return Err(DefinitionError::UnknownFlowReference {
                    flow: flow.id.clone(),
                    element: endpoint.clone(),
                });
            }
        }
        if matches!(element_kind(&flow.target), Some(ElementKind::StartEvent { .. })) {
            return Err(DefinitionError::IncomingToStart(flow.id.clone()));
        }
        if matches!(element_kind(&flow.source), Some(ElementKind::EndEvent)) {
            return Err(DefinitionError::OutgoingFromEnd(flow.id.clone()));
        }
    }

    for element in &model.elements {
        let invalid = |message: &str| DefinitionError::Invalid {
            element: element.id.clone(),
            message: message.to_string(),
        };

        if !matches!(element.kind, ElementKind::EndEvent)
            && !model.flows.iter().any(|f| f.source == element.id)
        {
            return Err(DefinitionError::NoOutgoingFlows(element.id.clone()));
        }

        match &element.kind {
            ElementKind::ServiceTask { handler, .. } if handler.trim().is_empty() => {
                return Err(invalid("handler must not be empty"));
            }
            ElementKind::BusinessRuleTask { decision_key, .. } if decision_key.trim().is_empty() => {
                return Err(invalid("decision_key must not be empty"));
            }
            ElementKind::TimerEvent { duration } => {
                parse_duration(duration)?;
            }
            ElementKind::UserTask(task) => {
                if let Some(due_in) = &task.due_in {
                    parse_duration(due_in)?;
                }
            }
            ElementKind::ExclusiveGateway {
                default: Some(default),
            } => {
                let flow = model.flows.iter().find(|f| &f.id == default);
                match flow {
                    Some(f) if f.source == element.id && f.condition.is_none() => {}
                    _ => {
                        return Err(DefinitionError::InvalidDefault {
                            gateway: element.id.clone(),
                            flow: default.clone(),
                        })
                    }
                }
            }
            _ => {}
        }
    }

    Ok(ProcessModel::from_validated(model, start))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &str = r#"
key: order
name: Order handling
elements:
  - id: start
    type: start_event
  - id: review
    type: user_task
    name: Review order
    candidate_groups: [sales]
  - id: route
    type: exclusive_gateway
    default: to_manual
  - id: auto
    type: service_task
    handler: ship
    async: true
  - id: manual
    type: user_task
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: review }
  - { id: f2, source: review, target: route }
  - { id: f3, source: route, target: auto, condition: "${amount < 100}" }
  - { id: to_manual, source: route, target: manual }
  - { id: f5, source: auto, target: end }
  - { id: f6, source: manual, target: end }
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let model = parse_definition(ORDER, SourceFormat::Yaml, &ParseOptions::safe()).unwrap();
        assert_eq!(model.key(), "order");
        assert_eq!(model.start_event().id, "start");
        assert_eq!(model.outgoing("route").count(), 2);
        assert_eq!(model.incoming_count("end"), 2);
        assert!(matches!(
            model.element("auto").map(|e| &e.kind),
            Some(ElementKind::ServiceTask {
                asynchronous: true,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{
            "key": "tiny",
            "elements": [
                {"id": "s", "type": "start_event"},
                {"id": "e", "type": "end_event"}
            ],
            "flows": [{"id": "f", "source": "s", "target": "e"}]
        }"#;
        let model = parse_definition(json, SourceFormat::Json, &ParseOptions::default()).unwrap();
        assert_eq!(model.key(), "tiny");
    }

    #[test]
    fn test_safe_mode_limits() {
        let options = ParseOptions {
            max_source_bytes: 16,
            ..ParseOptions::safe()
        };
        assert!(matches!(
            parse_definition(ORDER, SourceFormat::Yaml, &options),
            Err(DefinitionError::TooLarge { .. })
        ));

        let options = ParseOptions {
            max_elements: 3,
            ..ParseOptions::safe()
        };
        assert!(matches!(
            parse_definition(ORDER, SourceFormat::Yaml, &options),
            Err(DefinitionError::TooManyElements { count: 12, limit: 3 })
        ));
    }

    #[test]
    fn test_validation_rules() {
        let missing_end = ORDER.replace("type: end_event", "type: receive_task");
        assert!(matches!(
            parse_definition(&missing_end, SourceFormat::Yaml, &ParseOptions::default()),
            Err(DefinitionError::MissingEndEvent)
        ));

        let bad_default = ORDER.replace("default: to_manual", "default: f3");
        assert!(matches!(
            parse_definition(&bad_default, SourceFormat::Yaml, &ParseOptions::default()),
            Err(DefinitionError::InvalidDefault { .. })
        ));

        let dangling = ORDER.replace("target: manual }", "target: nowhere }");
        assert!(matches!(
            parse_definition(&dangling, SourceFormat::Yaml, &ParseOptions::default()),
            Err(DefinitionError::UnknownFlowReference { .. })
        ));

        let duplicate = ORDER.replace("id: manual\n", "id: auto\n");
        assert!(matches!(
            parse_definition(&duplicate, SourceFormat::Yaml, &ParseOptions::default()),
            Err(DefinitionError::DuplicateId(id)) if id == "auto"
        ));
    }

    struct RenameKey;

    impl ParseHandler for RenameKey {
        fn pre_parse(&self, model: &mut ProcessDefinitionModel) -> Result<(), DefinitionError> {
            model.key = format!("tenant-{}", model.key);
            Ok(())
        }
    }

    struct RejectAsync;

    impl ParseHandler for RejectAsync {
        fn post_parse(&self, model: &ProcessModel) -> Result<(), DefinitionError> {
            let has_async = model.elements().iter().any(|e| {
                matches!(
                    e.kind,
                    ElementKind::ServiceTask {
                        asynchronous: true,
                        ..
                    }
                )
            });
            if has_async {
                return Err(DefinitionError::Handler("async service tasks are not allowed".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_parse_handlers() {
        let options = ParseOptions {
            pre_parse_handlers: vec![Arc::new(RenameKey)],
            ..ParseOptions::default()
        };
        let model = parse_definition(ORDER, SourceFormat::Yaml, &options).unwrap();
        assert_eq!(model.key(), "tenant-order");

        let options = ParseOptions {
            post_parse_handlers: vec![Arc::new(RejectAsync)],
            ..ParseOptions::default()
        };
        assert!(matches!(
            parse_definition(ORDER, SourceFormat::Yaml, &options),
            Err(DefinitionError::Handler(_))
        ));
    }

    #[test]
    fn test_resource_format() {
        assert_eq!(
            SourceFormat::from_resource_name("a/b/order.YML").unwrap(),
            SourceFormat::Yaml
        );
        assert_eq!(
            SourceFormat::from_resource_name("order.json").unwrap(),
            SourceFormat::Json
        );
        assert!(SourceFormat::from_resource_name("order.bpmn20.xml").is_err());
    }
}
