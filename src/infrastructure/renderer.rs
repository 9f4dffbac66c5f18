//! A minimal text renderer standing in for the typesetting engine: templates
//! are UTF-8 text with `{{ field.path }}` placeholders filled from the
//! payload.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::domain::{error::RenderError, repository::Renderer};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    id: String,
    segments: Arc<Vec<Segment>>,
}

impl CompiledTemplate {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    fn parse(source: &str) -> Result<Vec<Segment>, RenderError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| RenderError::InvalidTemplate("unclosed placeholder".to_string()))?;

            let name = after[..end].trim();
            if name.is_empty() || name.split('.').any(str::is_empty) {
                return Err(RenderError::InvalidTemplate(format!(
                    "bad placeholder {:?}",
                    &after[..end]
                )));
            }
            segments.push(Segment::Field(name.split('.').map(str::to_string).collect()));
            rest = &after[end + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(segments)
    }

    fn lookup<'a>(data: &'a Value, path: &[String]) -> Option<&'a Value> {
        path.iter().try_fold(data, |value, part| match value {
            Value::Object(map) => map.get(part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl Renderer for PlaceholderRenderer {
    type Template = CompiledTemplate;

    fn compile(&self, template_ref: &str, source: &[u8]) -> Result<CompiledTemplate, RenderError> {
        let source = std::str::from_utf8(source)
            .map_err(|e| RenderError::InvalidTemplate(format!("template is not UTF-8: {}", e)))?;

        Ok(CompiledTemplate {
            id: template_ref.to_string(),
            segments: Arc::new(Self::parse(source)?),
        })
    }

    fn render(&self, template: &CompiledTemplate, data: &Value) -> Result<Bytes, RenderError> {
        let mut out = String::new();

        for segment in template.segments.iter() {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => match Self::lookup(data, path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {
                        return Err(RenderError::InvalidPayload(format!(
                            "missing field {:?}",
                            path.join(".")
                        )))
                    }
                    Some(other) => out.push_str(&other.to_string()),
                },
            }
        }

        Ok(Bytes::from(out))
    }
}
