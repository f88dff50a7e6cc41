use axum::http::{HeaderName, HeaderValue};
use axum_extra::headers::{self, Header};

pub static MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");

/// The `Mcp-Session-Id` header. Values must be non-empty visible ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpSessionId(pub String);

impl McpSessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Header for McpSessionId {
    fn name() -> &'static HeaderName {
        &MCP_SESSION_ID
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value
            .to_str()
            .map_err(|_| headers::Error::invalid())?
            .trim();

        if value.is_empty() || !value.bytes().all(|byte| (0x21..=0x7e).contains(&byte)) {
            return Err(headers::Error::invalid());
        }

        Ok(Self(value.to_string()))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}
