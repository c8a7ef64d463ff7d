//! Flow definitions — trigger configuration, node graph and nurturing
//! sequence for an automated conversation.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{hhmm, Tenant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMode {
    ExactCase,
    ExactIgnoreCase,
    IncludesCase,
    IncludesIgnoreCase,
}

impl MatchMode {
    pub fn ignores_case(&self) -> bool {
        matches!(self, MatchMode::ExactIgnoreCase | MatchMode::IncludesIgnoreCase)
    }
}

/// Time-of-day range during which a flow may engage. `end` before `start`
/// wraps past midnight; `start == end` is open all day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
        }
    }
}

/// A `{{name}}` placeholder and the literal used when the phonebook has no
/// value for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub fallback: String,
}

/// Where a media node's file comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    Link(String),
    /// Id in the tenant's media library, resolved at dispatch time.
    Asset(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyOption {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub name: String,
    pub phone: String,
}

/// Typed payload of a flow node, one variant per node kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodePayload {
    Start,
    Text {
        body: String,
        #[serde(default)]
        preview_url: bool,
    },
    Image {
        media: MediaSource,
        #[serde(default)]
        caption: Option<String>,
    },
    Video {
        media: MediaSource,
        #[serde(default)]
        caption: Option<String>,
    },
    Audio {
        media: MediaSource,
    },
    Document {
        media: MediaSource,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        filename: Option<String>,
    },
    Button {
        body: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        footer: Option<String>,
        buttons: Vec<ReplyOption>,
    },
    List {
        body: String,
        button_label: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        footer: Option<String>,
        sections: Vec<ListSection>,
    },
    FlowRedirect {
        body: String,
        cta: String,
        meta_flow_id: String,
        screen: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        footer: Option<String>,
    },
    Contact {
        contacts: Vec<ContactCard>,
    },
    Template {
        name: String,
        language: String,
        #[serde(default)]
        body_params: Vec<String>,
    },
    LocationRequest {
        body: String,
    },
    End,
}

impl NodePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            NodePayload::Start => "start",
            NodePayload::Text { .. } => "text",
            NodePayload::Image { .. } => "image",
            NodePayload::Video { .. } => "video",
            NodePayload::Audio { .. } => "audio",
            NodePayload::Document { .. } => "document",
            NodePayload::Button { .. } => "button",
            NodePayload::List { .. } => "list",
            NodePayload::FlowRedirect { .. } => "flow_redirect",
            NodePayload::Contact { .. } => "contact",
            NodePayload::Template { .. } => "template",
            NodePayload::LocationRequest { .. } => "location_request",
            NodePayload::End => "end",
        }
    }

    /// Interactive nodes suspend traversal until the recipient replies.
    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            NodePayload::Button { .. } | NodePayload::List { .. } | NodePayload::FlowRedirect { .. }
        )
    }

    /// Whether this node produces an outbound message.
    pub fn is_dispatchable(&self) -> bool {
        !matches!(self, NodePayload::Start | NodePayload::End)
    }

    /// Rewrites every recipient-visible text field through `f`.
    pub fn map_text<F: Fn(&str) -> String>(&self, f: F) -> NodePayload {
        let opt = |v: &Option<String>| v.as_deref().map(&f);
        match self {
            NodePayload::Text { body, preview_url } => NodePayload::Text {
                body: f(body.as_str()),
                preview_url: *preview_url,
            },
            NodePayload::Image { media, caption } => NodePayload::Image {
                media: media.clone(),
                caption: opt(caption),
            },
            NodePayload::Video { media, caption } => NodePayload::Video {
                media: media.clone(),
                caption: opt(caption),
            },
            NodePayload::Document {
                media,
                caption,
                filename,
            } => NodePayload::Document {
                media: media.clone(),
                caption: opt(caption),
                filename: filename.clone(),
            },
            NodePayload::Button {
                body,
                header,
                footer,
                buttons,
            } => NodePayload::Button {
                body: f(body.as_str()),
                header: opt(header),
                footer: opt(footer),
                buttons: buttons.clone(),
            },
            NodePayload::List {
                body,
                button_label,
                header,
                footer,
                sections,
            } => NodePayload::List {
                body: f(body.as_str()),
                button_label: button_label.clone(),
                header: opt(header),
                footer: opt(footer),
                sections: sections.clone(),
            },
            NodePayload::FlowRedirect {
                body,
                cta,
                meta_flow_id,
                screen,
                header,
                footer,
            } => NodePayload::FlowRedirect {
                body: f(body.as_str()),
                cta: cta.clone(),
                meta_flow_id: meta_flow_id.clone(),
                screen: screen.clone(),
                header: opt(header),
                footer: opt(footer),
            },
            NodePayload::Template {
                name,
                language,
                body_params,
            } => NodePayload::Template {
                name: name.clone(),
                language: language.clone(),
                body_params: body_params.iter().map(|p| f(p.as_str())).collect(),
            },
            NodePayload::LocationRequest { body } => NodePayload::LocationRequest { body: f(body.as_str()) },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub payload: NodePayload,
    #[serde(default)]
    pub delay_secs: u64,
}

/// Directed edge. `source_handle` is either the source node id, the
/// literal `"source"`, or the option id of an interactive node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: String,
    pub source_handle: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NurturingStep {
    pub after_secs: u64,
    pub payload: NodePayload,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
}

/// Copies every engaging inbound message to another number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub to: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub tenant: Tenant,
    pub name: String,
    /// Empty means catch-all.
    #[serde(default)]
    pub triggers: Vec<String>,
    pub match_mode: MatchMode,
    pub active: bool,
    #[serde(default)]
    pub window: TimeWindow,
    #[serde(default)]
    pub cooldown_secs: u64,
    /// Quote the inbound message on outgoing nodes.
    #[serde(default)]
    pub reply_context: bool,
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default)]
    pub nurturing: Vec<NurturingStep>,
    #[serde(default)]
    pub forward: Option<ForwardRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
