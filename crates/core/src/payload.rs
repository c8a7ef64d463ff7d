//! Builds transport-ready WhatsApp Cloud message bodies from typed node
//! payloads.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::collaborators::{AssetCatalog, PhonebookLookup};
use crate::error::{ChatflowError, ChatflowResult};
use crate::flow::{MediaSource, NodePayload, TemplateVariable};
use crate::types::{OutboundPayload, Tenant};

const MAX_REPLY_BUTTONS: usize = 3;
const MAX_LIST_ROWS: usize = 10;

/// Renders [`NodePayload`]s into the JSON the transport posts verbatim.
#[derive(Clone)]
pub struct PayloadBuilder {
    assets: Arc<dyn AssetCatalog>,
}

impl PayloadBuilder {
    pub fn new(assets: Arc<dyn AssetCatalog>) -> Self {
        Self { assets }
    }

    /// Builds the full message for `recipient`. `reply_to` quotes an earlier
    /// transport message.
    pub fn build(
        &self,
        tenant: &Tenant,
        recipient: &str,
        payload: &NodePayload,
        reply_to: Option<&str>,
    ) -> ChatflowResult<OutboundPayload> {
        let (kind, content) = self.content(tenant, payload)?;

        let mut body = Map::new();
        body.insert("messaging_product".into(), json!("whatsapp"));
        body.insert("recipient_type".into(), json!("individual"));
        body.insert("to".into(), json!(recipient));
        body.insert("type".into(), json!(kind));
        body.insert(kind.into(), content);
        if let Some(message_id) = reply_to {
            body.insert("context".into(), json!({ "message_id": message_id }));
        }

        Ok(OutboundPayload {
            message_type: payload.kind().to_string(),
            body: Value::Object(body),
        })
    }

    fn content(&self, tenant: &Tenant, payload: &NodePayload) -> ChatflowResult<(&'static str, Value)> {
        let content = match payload {
            NodePayload::Start | NodePayload::End => {
                return Err(ChatflowError::validation(format!(
                    "{} node has no message payload",
                    payload.kind()
                )))
            }
            NodePayload::Text { body, preview_url } => {
                non_empty("text body", body)?;
                ("text", json!({ "body": body, "preview_url": preview_url }))
            }
            NodePayload::Image { media, caption } => {
                let mut obj = self.media(tenant, media)?;
                insert_opt(&mut obj, "caption", caption);
                ("image", Value::Object(obj))
            }
            NodePayload::Video { media, caption } => {
                let mut obj = self.media(tenant, media)?;
                insert_opt(&mut obj, "caption", caption);
                ("video", Value::Object(obj))
            }
            NodePayload::Audio { media } => ("audio", Value::Object(self.media(tenant, media)?)),
            NodePayload::Document {
                media,
                caption,
                filename,
            } => {
                let mut obj = self.media(tenant, media)?;
                insert_opt(&mut obj, "caption", caption);
                insert_opt(&mut obj, "filename", filename);
                ("document", Value::Object(obj))
            }
            NodePayload::Button {
                body,
                header,
                footer,
                buttons,
            } => {
                if buttons.is_empty() || buttons.len() > MAX_REPLY_BUTTONS {
                    return Err(ChatflowError::validation(format!(
                        "button node needs 1-{} buttons, got {}",
                        MAX_REPLY_BUTTONS,
                        buttons.len()
                    )));
                }
                let buttons: Vec<Value> = buttons
                    .iter()
                    .map(|b| json!({ "type": "reply", "reply": { "id": b.id, "title": b.title } }))
                    .collect();
                let action = json!({ "buttons": buttons });
                ("interactive", interactive("button", body, header, footer, action)?)
            }
            NodePayload::List {
                body,
                button_label,
                header,
                footer,
                sections,
            } => {
                let rows: usize = sections.iter().map(|s| s.rows.len()).sum();
                if rows == 0 || rows > MAX_LIST_ROWS {
                    return Err(ChatflowError::validation(format!(
                        "list node needs 1-{} rows, got {}",
                        MAX_LIST_ROWS, rows
                    )));
                }
                let sections: Vec<Value> = sections
                    .iter()
                    .map(|s| {
                        let rows: Vec<Value> = s
                            .rows
                            .iter()
                            .map(|r| {
                                let mut row = Map::new();
                                row.insert("id".into(), json!(r.id));
                                row.insert("title".into(), json!(r.title));
                                insert_opt(&mut row, "description", &r.description);
                                Value::Object(row)
                            })
                            .collect();
                        json!({ "title": s.title, "rows": rows })
                    })
                    .collect();
                let action = json!({ "button": button_label, "sections": sections });
                ("interactive", interactive("list", body, header, footer, action)?)
            }
            NodePayload::FlowRedirect {
                body,
                cta,
                meta_flow_id,
                screen,
                header,
                footer,
            } => {
                non_empty("flow id", meta_flow_id)?;
                let action = json!({
                    "name": "flow",
                    "parameters": {
                        "flow_message_version": "3",
                        "flow_id": meta_flow_id,
                        "flow_cta": cta,
                        "flow_action": "navigate",
                        "flow_action_payload": { "screen": screen }
                    }
                });
                ("interactive", interactive("flow", body, header, footer, action)?)
            }
            NodePayload::Contact { contacts } => {
                if contacts.is_empty() {
                    return Err(ChatflowError::validation("contact node has no contacts"));
                }
                let cards: Vec<Value> = contacts
                    .iter()
                    .map(|c| {
                        json!({
                            "name": { "formatted_name": c.name, "first_name": c.name },
                            "phones": [{ "phone": c.phone, "type": "CELL" }]
                        })
                    })
                    .collect();
                ("contacts", Value::Array(cards))
            }
            NodePayload::Template {
                name,
                language,
                body_params,
            } => {
                if !self.assets.has_template(tenant, name, language)? {
                    return Err(ChatflowError::validation(format!(
                        "template '{}' ({}) not found",
                        name, language
                    )));
                }
                let mut template = json!({ "name": name, "language": { "code": language } });
                if !body_params.is_empty() {
                    let params: Vec<Value> = body_params
                        .iter()
                        .map(|p| json!({ "type": "text", "text": p }))
                        .collect();
                    template["components"] = json!([{ "type": "body", "parameters": params }]);
                }
                ("template", template)
            }
            NodePayload::LocationRequest { body } => {
                non_empty("location request body", body)?;
                (
                    "interactive",
                    json!({
                        "type": "location_request_message",
                        "body": { "text": body },
                        "action": { "name": "send_location" }
                    }),
                )
            }
        };
        Ok(content)
    }

    fn media(&self, tenant: &Tenant, source: &MediaSource) -> ChatflowResult<Map<String, Value>> {
        let link = match source {
            MediaSource::Link(url) => {
                non_empty("media link", url)?;
                url.clone()
            }
            MediaSource::Asset(asset_id) => self
                .assets
                .media_link(tenant, asset_id)?
                .ok_or_else(|| ChatflowError::validation(format!("media asset '{}' not found", asset_id)))?,
        };
        let mut obj = Map::new();
        obj.insert("link".into(), json!(link));
        Ok(obj)
    }
}

fn interactive(
    kind: &str,
    body: &str,
    header: &Option<String>,
    footer: &Option<String>,
    action: Value,
) -> ChatflowResult<Value> {
    non_empty("interactive body", body)?;
    let mut obj = Map::new();
    obj.insert("type".into(), json!(kind));
    if let Some(h) = header.as_deref().filter(|h| !h.is_empty()) {
        obj.insert("header".into(), json!({ "type": "text", "text": h }));
    }
    obj.insert("body".into(), json!({ "text": body }));
    if let Some(f) = footer.as_deref().filter(|f| !f.is_empty()) {
        obj.insert("footer".into(), json!({ "text": f }));
    }
    obj.insert("action".into(), action);
    Ok(Value::Object(obj))
}

fn insert_opt(obj: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
        obj.insert(key.into(), json!(v));
    }
}

fn non_empty(what: &str, value: &str) -> ChatflowResult<()> {
    if value.trim().is_empty() {
        Err(ChatflowError::validation(format!("{} is empty", what)))
    } else {
        Ok(())
    }
}

// ─── Phonebook substitution ─────────────────────────────────────────────────

/// Replaces each declared `{{name}}` with the contact's field, or with the
/// variable's fallback when the field is absent or empty.
pub fn substitute(text: &str, fields: &HashMap<String, String>, vars: &[TemplateVariable]) -> String {
    let mut result = text.to_string();
    for var in vars {
        let placeholder = format!("{{{{{}}}}}", var.name);
        let value = fields
            .get(&var.name)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(&var.fallback);
        result = result.replace(&placeholder, value);
    }
    result
}

/// Applies phonebook substitution to every text field of `payload`.
pub fn personalize(
    phonebook: &dyn PhonebookLookup,
    tenant: &Tenant,
    recipient: &str,
    payload: &NodePayload,
    vars: &[TemplateVariable],
) -> ChatflowResult<NodePayload> {
    if vars.is_empty() {
        return Ok(payload.clone());
    }
    let fields = phonebook.find_by_phone(tenant, recipient)?.unwrap_or_default();
    Ok(payload.map_text(|text| substitute(text, &fields, vars)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryAssets, InMemoryPhonebook};
    use crate::flow::{ListRow, ListSection, ReplyOption};

    fn tenant() -> Tenant {
        Tenant::new("acct", "dev")
    }

    fn builder() -> (PayloadBuilder, Arc<InMemoryAssets>) {
        let assets = Arc::new(InMemoryAssets::new());
        (PayloadBuilder::new(assets.clone()), assets)
    }

    #[test]
    fn test_text_with_reply_context() {
        let (builder, _) = builder();
        let out = builder
            .build(
                &tenant(),
                "15550001",
                &NodePayload::Text {
                    body: "Hello".into(),
                    preview_url: false,
                },
                Some("wamid.in"),
            )
            .unwrap();
        assert_eq!(out.message_type, "text");
        assert_eq!(out.body["to"], "15550001");
        assert_eq!(out.body["text"]["body"], "Hello");
        assert_eq!(out.body["context"]["message_id"], "wamid.in");
    }

    #[test]
    fn test_buttons_render_as_interactive() {
        let (builder, _) = builder();
        let payload = NodePayload::Button {
            body: "Continue?".into(),
            header: Some("Quick question".into()),
            footer: None,
            buttons: vec![
                ReplyOption {
                    id: "yes".into(),
                    title: "Yes".into(),
                },
                ReplyOption {
                    id: "no".into(),
                    title: "No".into(),
                },
            ],
        };
        let out = builder.build(&tenant(), "1", &payload, None).unwrap();
        assert_eq!(out.body["type"], "interactive");
        assert_eq!(out.body["interactive"]["type"], "button");
        assert_eq!(out.body["interactive"]["action"]["buttons"][1]["reply"]["id"], "no");
        assert!(out.body.get("context").is_none());
        assert!(out.body["interactive"].get("footer").is_none());
    }

    #[test]
    fn test_rejects_oversized_interactive() {
        let (builder, _) = builder();
        let buttons = (0..4)
            .map(|i| ReplyOption {
                id: format!("b{}", i),
                title: "x".into(),
            })
            .collect();
        let err = builder
            .build(
                &tenant(),
                "1",
                &NodePayload::Button {
                    body: "b".into(),
                    header: None,
                    footer: None,
                    buttons,
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ChatflowError::Validation(_)));

        let empty_list = NodePayload::List {
            body: "b".into(),
            button_label: "Open".into(),
            header: None,
            footer: None,
            sections: vec![ListSection {
                title: "s".into(),
                rows: Vec::<ListRow>::new(),
            }],
        };
        assert!(builder.build(&tenant(), "1", &empty_list, None).is_err());
    }

    #[test]
    fn test_media_and_template_references_resolve() {
        let (builder, assets) = builder();
        let image = NodePayload::Image {
            media: MediaSource::Asset("logo".into()),
            caption: Some("Our logo".into()),
        };
        assert!(matches!(
            builder.build(&tenant(), "1", &image, None),
            Err(ChatflowError::Validation(_))
        ));
        assets.add_media(&tenant(), "logo", "https://cdn.example/logo.png");
        let out = builder.build(&tenant(), "1", &image, None).unwrap();
        assert_eq!(out.body["image"]["link"], "https://cdn.example/logo.png");
        assert_eq!(out.body["image"]["caption"], "Our logo");

        let template = NodePayload::Template {
            name: "promo".into(),
            language: "en_US".into(),
            body_params: vec!["Ana".into()],
        };
        assert!(builder.build(&tenant(), "1", &template, None).is_err());
        assets.add_template(&tenant(), "promo", "en_US");
        let out = builder.build(&tenant(), "1", &template, None).unwrap();
        assert_eq!(out.body["template"]["components"][0]["parameters"][0]["text"], "Ana");
        assert!(builder.build(&tenant(), "1", &NodePayload::End, None).is_err());
    }

    #[test]
    fn test_substitute_uses_fallback_for_missing_or_empty() {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), "Ana".to_string());
        fields.insert("city".to_string(), "  ".to_string());
        let vars = vec![
            TemplateVariable {
                name: "name".into(),
                fallback: "friend".into(),
            },
            TemplateVariable {
                name: "city".into(),
                fallback: "your city".into(),
            },
            TemplateVariable {
                name: "plan".into(),
                fallback: "basic".into(),
            },
        ];
        let out = substitute("Hi {{name}} from {{city}} on {{plan}} {{unknown}}", &fields, &vars);
        assert_eq!(out, "Hi Ana from your city on basic {{unknown}}");
    }

    #[test]
    fn test_personalize_reads_phonebook() {
        let phonebook = InMemoryPhonebook::new();
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), "Rui".to_string());
        phonebook.upsert(&tenant(), "1", fields);
        let vars = vec![TemplateVariable {
            name: "name".into(),
            fallback: "there".into(),
        }];
        let payload = NodePayload::Text {
            body: "Hey {{name}}".into(),
            preview_url: false,
        };

        let known = personalize(&phonebook, &tenant(), "1", &payload, &vars).unwrap();
        let unknown = personalize(&phonebook, &tenant(), "2", &payload, &vars).unwrap();
        assert_eq!(known, NodePayload::Text {
            body: "Hey Rui".into(),
            preview_url: false
        });
        assert_eq!(unknown, NodePayload::Text {
            body: "Hey there".into(),
            preview_url: false
        });
    }
}
