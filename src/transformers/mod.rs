pub mod chart;
pub mod fingerprint;
pub mod ingestion;

use crate::generator::CodeGenerator;
use crate::redaction::Redactor;
use crate::sandbox::Sandbox;
use std::sync::Arc;

/// Everything the get-or-generate and execute halves need, shared by both transformer kinds.
#[derive(Clone)]
pub struct TransformerContext {
    pub generator: Arc<dyn CodeGenerator>,
    pub sandbox: Sandbox,
    pub redactor: Redactor,
    pub max_sample_bytes: usize,
}

/// A transformer ready to run, and whether it was generated in this call.
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub transformer: T,
    pub generated: bool,
}

impl<T> Resolved<T> {
    /// The transformer to persist, when it is new.
    pub fn fresh(&self) -> Option<&T> {
        self.generated.then_some(&self.transformer)
    }
}
