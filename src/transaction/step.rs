use super::context::TxnCtx;
use crate::error::{Error, Result};
use crate::types::NodeId;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub type StepFuture = BoxFuture<'static, Result<()>>;

/// A registered do/undo callable.
pub type StepFunc = Arc<dyn Fn(TxnCtx) -> StepFuture + Send + Sync>;

/// One unit of work in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Step {
    pub do_func: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_func: Option<String>,
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub skip: bool,
}

impl Step {
    pub fn new(do_func: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        Self {
            do_func: do_func.into(),
            nodes,
            ..Self::default()
        }
    }

    pub fn with_undo(mut self, undo_func: impl Into<String>) -> Self {
        self.undo_func = Some(undo_func.into());
        self
    }

    /// Require every node to finish the previous step before this one starts.
    pub fn synchronized(mut self) -> Self {
        self.sync = true;
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn runs_on(&self, node: &NodeId) -> bool {
        !self.skip && self.nodes.contains(node)
    }

    fn func_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.do_func.as_str()).chain(self.undo_func.as_deref())
    }
}

/// Name to callable table, filled at start-up before transactions run.
#[derive(Clone, Default)]
pub struct StepRegistry {
    funcs: Arc<DashMap<String, StepFunc>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: &str, func: F) -> Result<()>
    where
        F: Fn(TxnCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        use dashmap::mapref::entry::Entry;

        match self.funcs.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::StepFuncExists(name.to_string())),
            Entry::Vacant(slot) => {
                let func: StepFunc = Arc::new(move |ctx| Box::pin(func(ctx)) as StepFuture);
                slot.insert(func);
                debug!(name, "Registered step function");
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<StepFunc> {
        self.funcs
            .get(name)
            .map(|f| f.value().clone())
            .ok_or_else(|| Error::StepFuncNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.funcs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Reject unknown do/undo names before anything is published.
    pub fn validate(&self, steps: &[Step]) -> Result<()> {
        for step in steps {
            for name in step.func_names() {
                if !self.contains(name) {
                    return Err(Error::StepFuncNotFound(name.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = StepRegistry::new();
        registry.register("vol-create.Commit", |_ctx| async { Ok(()) }).unwrap();
        assert_eq!(
            registry
                .register("vol-create.Commit", |_ctx| async { Ok(()) })
                .unwrap_err(),
            Error::StepFuncExists("vol-create.Commit".to_string())
        );
        assert_eq!(registry.names(), vec!["vol-create.Commit".to_string()]);
    }

    #[test]
    fn test_validate_checks_undo_names() {
        let registry = StepRegistry::new();
        registry.register("do", |_ctx| async { Ok(()) }).unwrap();

        let node = NodeId::new();
        assert!(registry.validate(&[Step::new("do", vec![node])]).is_ok());
        assert_eq!(
            registry
                .validate(&[Step::new("do", vec![node]).with_undo("undo")])
                .unwrap_err(),
            Error::StepFuncNotFound("undo".to_string())
        );
        assert!(matches!(registry.get("missing"), Err(Error::StepFuncNotFound(_))));
    }

    #[test]
    fn test_runs_on() {
        let n1 = NodeId::new();
        let n2 = NodeId::new();
        let step = Step::new("do", vec![n1]);
        assert!(step.runs_on(&n1));
        assert!(!step.runs_on(&n2));
        assert!(!step.clone().skipped().runs_on(&n1));
    }
}
