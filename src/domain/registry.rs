//! Named, schema-validated procedures
//!
//! Each procedure pairs a published `Tool` definition (name, description and JSON input
//! schema) with a handler taking a statically typed parameter struct. Raw arguments are
//! validated by deserializing into that struct before the handler ever runs.

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt};
use rust_mcp_sdk::schema::{CallToolResult, Tool};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub type HandlerResult = Result<CallToolResult, HandlerError>;

type BoxedHandler =
    Arc<dyn Fn(Value) -> Result<BoxFuture<'static, HandlerResult>, ValidationError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("procedure `{0}` is already registered")]
    DuplicateProcedure(String),
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[derive(Debug, Clone, Error)]
#[error("invalid arguments: {detail}")]
pub struct ValidationError {
    pub detail: String,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl ValidationError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

struct Procedure {
    definition: Tool,
    handler: BoxedHandler,
}

#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: Vec<Procedure>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `definition.name`.
    ///
    /// `P` is the typed input the raw arguments must deserialize into; it should match the
    /// input schema carried by `definition`.
    pub fn register<P, F, Fut>(&mut self, definition: Tool, handler: F) -> Result<(), RegistryError>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.contains(&definition.name) {
            return Err(RegistryError::DuplicateProcedure(definition.name));
        }

        let handler: BoxedHandler = Arc::new(
            move |raw: Value| -> Result<BoxFuture<'static, HandlerResult>, ValidationError> {
                if !raw.is_object() {
                    return Err(ValidationError::new("arguments must be a JSON object"));
                }
                let input: P = serde_json::from_value(raw)
                    .map_err(|err| ValidationError::new(err.to_string()))?;
                Ok(handler(input).boxed())
            },
        );

        self.procedures.push(Procedure {
            definition,
            handler,
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn definitions(&self) -> Vec<Tool> {
        self.procedures
            .iter()
            .map(|procedure| procedure.definition.clone())
            .collect()
    }

    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<CallToolResult, InvokeError> {
        let procedure = self
            .find(name)
            .ok_or_else(|| InvokeError::UnknownProcedure(name.to_string()))?;

        let call = (procedure.handler)(arguments)?;
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::error!(procedure = %name, "procedure handler panicked");
                Err(InvokeError::Handler(HandlerError::new(format!(
                    "procedure `{name}` failed unexpectedly"
                ))))
            }
        }
    }

    fn find(&self, name: &str) -> Option<&Procedure> {
        self.procedures
            .iter()
            .find(|procedure| procedure.definition.name == name)
    }
}
