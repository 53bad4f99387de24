//! Process definition model
//!
//! The raw model is what a deployment resource deserializes into. It becomes
//! a [`ProcessModel`] once validated; only validated models are executed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Deserialized process definition, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinitionModel {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

/// A flow node of the process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    #[serde(flatten)]
    pub kind: ElementKind,
}

impl Element {
    pub fn new(id: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Supported element types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    StartEvent {
        #[serde(default)]
        form_key: Option<String>,
        #[serde(default)]
        form_properties: Vec<FormProperty>,
    },
    EndEvent,
    UserTask(UserTaskDefinition),
    ServiceTask {
        #[serde(default)]
        name: Option<String>,
        handler: String,
        #[serde(rename = "async", default)]
        asynchronous: bool,
    },
    BusinessRuleTask {
        #[serde(default)]
        name: Option<String>,
        decision_key: String,
        #[serde(default)]
        result_variable: Option<String>,
        #[serde(rename = "async", default)]
        asynchronous: bool,
    },
    /// Waits until triggered through the runtime service
    ReceiveTask {
        #[serde(default)]
        name: Option<String>,
    },
    TimerEvent {
        /// ISO-8601 duration, e.g. `PT5M`
        duration: String,
    },
    ExclusiveGateway {
        #[serde(default)]
        default: Option<String>,
    },
    ParallelGateway,
}

impl ElementKind {
    /// Short type name used in history records
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StartEvent { .. } => "start_event",
            Self::EndEvent => "end_event",
            Self::UserTask(_) => "user_task",
            Self::ServiceTask { .. } => "service_task",
            Self::BusinessRuleTask { .. } => "business_rule_task",
            Self::ReceiveTask { .. } => "receive_task",
            Self::TimerEvent { .. } => "timer_event",
            Self::ExclusiveGateway { .. } => "exclusive_gateway",
            Self::ParallelGateway => "parallel_gateway",
        }
    }

    /// Display name, when the element type carries one
    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::UserTask(task) => task.name.as_deref(),
            Self::ServiceTask { name, .. }
            | Self::BusinessRuleTask { name, .. }
            | Self::ReceiveTask { name } => name.as_deref(),
            _ => None,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, Self::ExclusiveGateway { .. } | Self::ParallelGateway)
    }
}

/// User task attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserTaskDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Literal user id or `${variable}` expression
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_users: Vec<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    #[serde(default)]
    pub form_key: Option<String>,
    #[serde(default)]
    pub form_properties: Vec<FormProperty>,
    #[serde(default)]
    pub priority: Option<i32>,
    /// ISO-8601 duration added to the creation time
    #[serde(default)]
    pub due_in: Option<String>,
}

/// Form property declared on a start event or user task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormProperty {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_form_type")]
    pub type_name: String,
    /// Variable the value is stored in, defaults to the property id
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default = "default_true")]
    pub writable: bool,
    /// Pattern for `date` properties
    #[serde(default)]
    pub date_pattern: Option<String>,
    /// Allowed values for `enum` properties
    #[serde(default)]
    pub values: Vec<FormEnumValue>,
}

impl FormProperty {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            type_name: type_name.into(),
            variable: None,
            required: false,
            readable: true,
            writable: true,
            date_pattern: None,
            values: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Name of the process variable backing this property
    pub fn variable_name(&self) -> &str {
        self.variable.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormEnumValue {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_form_type() -> String {
    "string".to_string()
}

fn default_true() -> bool {
    true
}

/// Directed edge between two elements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    /// `${...}` expression; absent means always taken
    #[serde(default)]
    pub condition: Option<String>,
}

impl SequenceFlow {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// A validated, indexed process definition
#[derive(Debug, Clone)]
pub struct ProcessModel {
    key: String,
    name: Option<String>,
    elements: Vec<Element>,
    flows: Vec<SequenceFlow>,
    element_index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, usize>,
    start: usize,
}

impl ProcessModel {
    /// Build the indexes. Callers must have validated the model.
    pub(crate) fn from_validated(model: ProcessDefinitionModel, start: usize) -> Self {
        let element_index = model
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, usize> = HashMap::new();
        for (i, flow) in model.flows.iter().enumerate() {
            outgoing.entry(flow.source.clone()).or_default().push(i);
            *incoming.entry(flow.target.clone()).or_default() += 1;
        }

        Self {
            key: model.key,
            name: model.name,
            elements: model.elements,
            flows: model.flows,
            element_index,
            outgoing,
            incoming,
            start,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn flows(&self) -> &[SequenceFlow] {
        &self.flows
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.element_index.get(id).map(|&i| &self.elements[i])
    }

    pub fn start_event(&self) -> &Element {
        &self.elements[self.start]
    }

    /// Outgoing flows in definition order
    pub fn outgoing(&self, element_id: &str) -> impl Iterator<Item = &SequenceFlow> + '_ {
        self.outgoing
            .get(element_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.flows[i])
    }

    pub fn incoming_count(&self, element_id: &str) -> usize {
        self.incoming.get(element_id).copied().unwrap_or(0)
    }

    pub fn flow(&self, flow_id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == flow_id)
    }

    /// Start form properties and key, if the start event declares a form
    pub fn start_form(&self) -> (Option<&str>, &[FormProperty]) {
        match &self.start_event().kind {
            ElementKind::StartEvent {
                form_key,
                form_properties,
            } => (form_key.as_deref(), form_properties.as_slice()),
            _ => (None, &[]),
        }
    }

    pub fn has_start_form(&self) -> bool {
        let (key, properties) = self.start_form();
        key.is_some() || !properties.is_empty()
    }
}
