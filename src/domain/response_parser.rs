use crate::domain::models::AssistantResponse;
use crate::infrastructure::error::InfraError;
use std::ops::Range;
use tracing::warn;

const COMMENTARY_FIELD: &str = "comentario";

/// Byte ranges of every complete top-level `{...}` object in `text`.
///
/// Braces inside JSON string literals are ignored. An object that is opened
/// but never closed is not reported.
pub fn find_json_objects(text: &str) -> Vec<Range<usize>> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, character) in text.char_indices() {
        if depth == 0 {
            if character == '{' {
                depth = 1;
                start = index;
                in_string = false;
                escaped = false;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
            } else if character == '\\' {
                escaped = true;
            } else if character == '"' {
                in_string = false;
            }
            continue;
        }

        match character {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    objects.push(start..index + 1);
                }
            }
            _ => {}
        }
    }

    objects
}

/// Splits an assistant message into leading prose, one JSON object and the
/// `comentario` value found inside it.
///
/// More than one object, or a single object that is not valid JSON, is an
/// error. Use [`parse_or_prose`] when malformed JSON should degrade to prose.
pub fn parse_assistant_response(message: &str) -> Result<AssistantResponse, InfraError> {
    if message.trim().is_empty() {
        return Ok(AssistantResponse::default());
    }

    let objects = find_json_objects(message);
    let range = match objects.as_slice() {
        [] => return Ok(AssistantResponse::prose(message.trim())),
        [range] => range.clone(),
        _ => {
            warn!(count = objects.len(), "assistant message holds several JSON objects");
            return Err(InfraError::MultipleJsonObjects(objects.len()));
        }
    };

    let json = &message[range.clone()];
    let parsed: serde_json::Value =
        serde_json::from_str(json).map_err(|error| InfraError::MalformedJson(error.to_string()))?;
    let commentary = parsed
        .get(COMMENTARY_FIELD)
        .and_then(|value| match value {
            serde_json::Value::String(text) => Some(text.trim().to_string()),
            serde_json::Value::Number(number) => Some(number.to_string()),
            serde_json::Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        })
        .unwrap_or_default();

    Ok(AssistantResponse {
        text: message[..range.start].trim().to_string(),
        json: json.to_string(),
        commentary,
    })
}

/// Like [`parse_assistant_response`], but a malformed JSON block makes the
/// whole message prose. Ambiguous payloads are still rejected.
pub fn parse_or_prose(message: &str) -> Result<AssistantResponse, InfraError> {
    match parse_assistant_response(message) {
        Err(InfraError::MalformedJson(detail)) => {
            warn!(%detail, "assistant JSON block is malformed, treating message as prose");
            Ok(AssistantResponse::prose(message.trim()))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blank_message_yields_empty_response() {
        let response = parse_assistant_response("   \n").expect("blank parses");
        assert_eq!(response, AssistantResponse::default());
        assert!(!response.has_text());
        assert!(!response.has_json());
        assert!(!response.has_commentary());
    }

    #[test]
    fn message_without_json_is_all_prose() {
        let response = parse_assistant_response("  Just some advice.  ").expect("prose parses");
        assert_eq!(response.text, "Just some advice.");
        assert!(!response.has_json());
        assert!(!response.has_commentary());
    }

    #[test]
    fn splits_prose_json_and_commentary() {
        let json = r#"{"comentario": "  Este es el comentario ", "propuesta": {"tasks": []}}"#;
        let message = format!("Here is my proposal:\n\n{json}");

        let response = parse_assistant_response(&message).expect("message parses");

        assert_eq!(response.text, "Here is my proposal:");
        assert_eq!(response.json, json);
        assert_eq!(response.commentary, "Este es el comentario");
    }

    #[test]
    fn nested_objects_and_braces_inside_strings_form_one_block() {
        let json = r#"{"comentario": "use {curly} \"quotes\"", "propuesta": {"tasks": [{"title": "a }", "subtasks": [{"title": "b"}]}]}}"#;
        let message = format!("Texto\n{json}\n");

        let response = parse_assistant_response(&message).expect("message parses");

        assert_eq!(response.json, json);
        assert_eq!(response.commentary, "use {curly} \"quotes\"");
    }

    #[test]
    fn json_without_commentary_has_empty_commentary() {
        let response =
            parse_assistant_response(r#"Ok {"propuesta": {"tasks": []}}"#).expect("message parses");
        assert_eq!(response.text, "Ok");
        assert!(response.has_json());
        assert!(!response.has_commentary());
    }

    #[test]
    fn unicode_commentary_is_preserved() {
        let response = parse_assistant_response(r#"{"comentario": "¡Ánimo! 🚀 ñandú"}"#)
            .expect("message parses");
        assert_eq!(response.commentary, "¡Ánimo! 🚀 ñandú");
        assert!(!response.has_text());
    }

    #[test]
    fn two_objects_are_rejected() {
        let result = parse_assistant_response(r#"{"a": 1} and {"b": 2}"#);
        assert!(matches!(result, Err(InfraError::MultipleJsonObjects(2))));
    }

    #[test]
    fn malformed_single_block_is_an_error_or_prose() {
        let message = "Look {not: json}";
        assert!(matches!(
            parse_assistant_response(message),
            Err(InfraError::MalformedJson(_))
        ));

        let fallback = parse_or_prose(message).expect("falls back to prose");
        assert_eq!(fallback, AssistantResponse::prose(message));
    }

    #[test]
    fn unbalanced_object_is_treated_as_prose() {
        let message = r#"Texto {"comentario": "x", "propuesta": {"#;
        let response = parse_assistant_response(message).expect("message parses");
        assert_eq!(response.text, message);
        assert!(!response.has_json());
    }

    proptest! {
        #[test]
        fn prose_followed_by_one_object_splits_deterministically(
            prose in "[A-Za-z ,.!?]{0,40}",
            comment in "[A-Za-z0-9 ]{0,30}"
        ) {
            let json = serde_json::json!({"comentario": comment, "propuesta": {"tasks": []}}).to_string();
            let message = format!("{prose}{json}");

            let response = parse_assistant_response(&message).expect("message parses");

            prop_assert_eq!(response.text, prose.trim().to_string());
            prop_assert_eq!(response.json, json);
            prop_assert_eq!(response.commentary, comment.trim().to_string());
        }

        #[test]
        fn text_without_braces_is_entirely_prose(prose in "[^{}]{0,80}") {
            let response = parse_assistant_response(&prose).expect("message parses");
            prop_assert_eq!(response.text, prose.trim().to_string());
            prop_assert!(response.json.is_empty());
        }
    }
}
