//! Stored notification templates with `{{variable}}` placeholders.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::channels::Channel;
use crate::error::CoreError;
use crate::notification::{Category, NotificationDraft, NotificationType, Priority};
use crate::types::DbId;

/// Matches `{{name}}` placeholders, allowing inner whitespace.
pub const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// A row from the `notification_templates` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub key: String,
    pub title_template: String,
    pub message_template: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: Category,
    pub priority: Priority,
    pub channels: Vec<Channel>,
}

impl NotificationTemplate {
    /// Render the template into a draft for `user_id`.
    ///
    /// Every placeholder must have a value in `vars`.
    pub fn render(
        &self,
        user_id: DbId,
        vars: &HashMap<String, String>,
    ) -> Result<NotificationDraft, CoreError> {
        let title = render_text(&self.title_template, vars)?;
        let message = render_text(&self.message_template, vars)?;
        let mut draft = NotificationDraft::for_user(user_id, title, message)
            .with_type(self.notification_type)
            .with_category(self.category)
            .with_priority(self.priority)
            .with_channels(self.channels.iter().copied())
            .with_source("template", self.key.clone());
        draft.metadata.insert(
            "template_vars".into(),
            serde_json::to_value(vars).unwrap_or_default(),
        );
        Ok(draft)
    }
}

/// Substitute `{{name}}` placeholders from `vars`.
pub fn render_text(template: &str, vars: &HashMap<String, String>) -> Result<String, CoreError> {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(CoreError::Validation(format!(
            "missing template variables: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_placeholders_with_whitespace() {
        let out = render_text("Task {{ task }} due {{date}}", &vars(&[("task", "T-1"), ("date", "Friday")])).unwrap();
        assert_eq!(out, "Task T-1 due Friday");
    }

    #[test]
    fn missing_variable_is_a_validation_error() {
        let err = render_text("Hi {{name}}", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn render_builds_draft_with_template_defaults() {
        let template = NotificationTemplate {
            key: "deadline.soon".into(),
            title_template: "{{project}} deadline".into(),
            message_template: "Due in {{days}} days".into(),
            notification_type: NotificationType::Warning,
            category: Category::Deadline,
            priority: Priority::High,
            channels: vec![Channel::InApp, Channel::Email],
        };
        let draft = template
            .render(7, &vars(&[("project", "Apollo"), ("days", "2")]))
            .unwrap();
        assert_eq!(draft.user_id, Some(7));
        assert_eq!(draft.title, "Apollo deadline");
        assert_eq!(draft.priority, Priority::High);
        assert_eq!(draft.source_id.as_deref(), Some("deadline.soon"));
        assert!(draft.check().is_ok());
    }
}
