//! Rendering of `sendMessage` content against session state.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::dispatch::{RenderedField, RenderedMessage};
use crate::fields::FieldMapper;
use crate::flow::model::{Button, ListRow, ListSection, MessageContent};
use crate::session::model::Session;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}\s][^{}]*?)\s*\}\}").expect("placeholder regex"));

/// Replace `{{name}}` with the session variable; unknown names render empty.
pub fn substitute(template: &str, session: &Session) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            session.variable(&caps[1]).unwrap_or_default().to_string()
        })
        .into_owned()
}

/// Render a node's message. Form fields get the version's generated names;
/// a field without a mapping keeps its component id.
pub fn render(
    node_id: &str,
    content: &MessageContent,
    session: &Session,
    mapper: FieldMapper<'_>,
) -> RenderedMessage {
    let sub = |s: &str| substitute(s, session);

    match content {
        MessageContent::Text { body } => RenderedMessage::Text { body: sub(body) },
        MessageContent::Media {
            media_type,
            url,
            caption,
        } => RenderedMessage::Media {
            media_type: *media_type,
            url: url.clone(),
            caption: caption.as_deref().map(sub),
        },
        MessageContent::Buttons { body, buttons } => RenderedMessage::Buttons {
            body: sub(body),
            buttons: buttons
                .iter()
                .map(|b| Button {
                    id: b.id.clone(),
                    title: sub(&b.title),
                })
                .collect(),
        },
        MessageContent::List {
            body,
            button_text,
            sections,
        } => RenderedMessage::List {
            body: sub(body),
            button_text: sub(button_text),
            sections: sections
                .iter()
                .map(|s| ListSection {
                    title: s.title.as_deref().map(sub),
                    rows: s
                        .rows
                        .iter()
                        .map(|r| ListRow {
                            id: r.id.clone(),
                            title: sub(&r.title),
                            description: r.description.as_deref().map(sub),
                        })
                        .collect(),
                })
                .collect(),
        },
        MessageContent::Form { body, cta, fields } => RenderedMessage::Form {
            body: sub(body),
            cta: sub(cta),
            flow_token: session.token.clone(),
            fields: fields
                .iter()
                .map(|f| RenderedField {
                    name: mapper
                        .field_name_for(node_id, &f.component_id)
                        .unwrap_or(&f.component_id)
                        .to_string(),
                    label: f.label.clone(),
                    required: f.required,
                })
                .collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::fields::FieldMapping;
    use crate::flow::model::FormField;

    fn session() -> Session {
        let mut s = Session::new("c", Uuid::new_v4(), 1);
        s.set_variable("name", "Ana");
        s
    }

    #[test]
    fn substitutes_known_and_blanks_unknown() {
        let s = session();
        assert_eq!(substitute("Hi {{name}}!", &s), "Hi Ana!");
        assert_eq!(substitute("Hi {{ name }}", &s), "Hi Ana");
        assert_eq!(substitute("[{{nope}}]", &s), "[]");
        assert_eq!(substitute("no placeholders", &s), "no placeholders");
    }

    #[test]
    fn form_fields_use_generated_names_and_session_token() {
        let s = session();
        let mappings = vec![FieldMapping {
            flow_id: s.flow_id,
            version: 1,
            node_id: "form".into(),
            component_id: "c1".into(),
            label: "Full Name".into(),
            field_name: "full_name_abc123".into(),
        }];
        let content = MessageContent::Form {
            body: "Hello {{name}}".into(),
            cta: "Open".into(),
            fields: vec![
                FormField { component_id: "c1".into(), label: "Full Name".into(), required: true },
                FormField { component_id: "c2".into(), label: "Other".into(), required: false },
            ],
        };

        let RenderedMessage::Form { body, flow_token, fields, .. } =
            render("form", &content, &s, FieldMapper::new(&mappings))
        else {
            panic!("expected form");
        };
        assert_eq!(body, "Hello Ana");
        assert_eq!(flow_token, s.token);
        assert_eq!(fields[0].name, "full_name_abc123");
        assert_eq!(fields[1].name, "c2");
    }
}
