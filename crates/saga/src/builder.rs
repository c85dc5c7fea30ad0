//! Fluent construction of a saga and its step definitions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use serde_json::{Map, Value};

use crate::aggregate::SagaInstance;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::orchestrator::SagaOrchestrator;
use crate::payload::StepPayload;
use crate::step::{SagaStep, StepDefinition};

/// A persisted `pending` saga together with the steps to run it with.
#[derive(Debug)]
pub struct BuiltSaga {
    pub instance: SagaInstance,
    pub steps: Vec<StepDefinition>,
}

/// Collects metadata and steps; nothing runs until the saga is executed.
///
/// Created through [`SagaOrchestrator::saga_builder`].
pub struct SagaBuilder {
    orchestrator: SagaOrchestrator,
    business_id: String,
    saga_type: String,
    metadata: Map<String, Value>,
    input: StepPayload,
    steps: Vec<StepDefinition>,
}

impl SagaBuilder {
    pub(crate) fn new(
        orchestrator: SagaOrchestrator,
        business_id: impl Into<String>,
        saga_type: impl Into<String>,
    ) -> Result<Self> {
        let business_id = business_id.into();
        let saga_type = saga_type.into();
        if business_id.trim().is_empty() {
            return Err(SagaError::EmptyBusinessId);
        }
        if saga_type.trim().is_empty() {
            return Err(SagaError::EmptySagaType);
        }

        Ok(Self {
            orchestrator,
            business_id,
            saga_type,
            metadata: Map::new(),
            input: StepPayload::empty(),
            steps: Vec::new(),
        })
    }

    /// Merges `metadata` into what was set before; on key clashes the new value wins.
    pub fn set_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Sets a single metadata key.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Input handed to the first step.
    pub fn with_input(mut self, input: StepPayload) -> Self {
        self.input = input;
        self
    }

    /// Appends a step with the configured default timeout.
    pub fn add_step(
        self,
        name: impl Into<String>,
        step: Arc<dyn SagaStep>,
        max_retry_count: u32,
    ) -> Self {
        let timeout = self.orchestrator.config().default_timeout;
        self.add_step_with_timeout(name, step, max_retry_count, timeout)
    }

    pub fn add_step_with_timeout(
        mut self,
        name: impl Into<String>,
        step: Arc<dyn SagaStep>,
        max_retry_count: u32,
        timeout: Duration,
    ) -> Self {
        self.steps
            .push(StepDefinition::new(name, step, max_retry_count, timeout));
        self
    }

    /// Appends a ready-made definition.
    pub fn add_definition(mut self, definition: StepDefinition) -> Self {
        self.steps.push(definition);
        self
    }

    /// Persists the saga in `pending` status. Does not run any step.
    #[tracing::instrument(skip(self), fields(business_id = %self.business_id, saga_type = %self.saga_type))]
    pub async fn build(self) -> Result<BuiltSaga> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(SagaError::DuplicateStep(step.name.clone()));
            }
        }

        let created = SagaEvent::saga_created(
            SagaId::new(),
            self.business_id,
            self.saga_type,
            self.steps.iter().map(|s| s.name.clone()).collect(),
            self.metadata,
            self.input,
        );

        let mut instance = SagaInstance::default();
        self.orchestrator.record(&mut instance, created).await?;

        tracing::debug!(saga_id = %instance.id(), steps = self.steps.len(), "saga built");

        Ok(BuiltSaga {
            instance,
            steps: self.steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use saga_journal::InMemorySagaJournal;

    use super::*;
    use crate::context::StepContext;
    use crate::state::SagaStatus;
    use crate::step::StepError;

    struct Echo;

    #[async_trait]
    impl SagaStep for Echo {
        async fn execute(
            &self,
            _ctx: &StepContext,
            input: StepPayload,
        ) -> std::result::Result<StepPayload, StepError> {
            Ok(input)
        }
    }

    fn orchestrator() -> SagaOrchestrator {
        SagaOrchestrator::new(Arc::new(InMemorySagaJournal::new()))
    }

    #[test]
    fn empty_keys_are_rejected() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.saga_builder("", "payment"),
            Err(SagaError::EmptyBusinessId)
        ));
        assert!(matches!(
            orchestrator.saga_builder("PAY-1", " "),
            Err(SagaError::EmptySagaType)
        ));
    }

    #[tokio::test]
    async fn build_persists_pending_saga() {
        let orchestrator = orchestrator();
        let built = orchestrator
            .saga_builder("PAY-1", "payment")
            .unwrap()
            .metadata("amount", 1000)
            .add_step("A", Arc::new(Echo), 3)
            .add_step_with_timeout("B", Arc::new(Echo), 0, Duration::from_secs(5))
            .build()
            .await
            .unwrap();

        assert_eq!(built.instance.status(), SagaStatus::Pending);
        assert_eq!(built.instance.step_names(), vec!["A", "B"]);
        assert_eq!(built.steps[0].timeout, Duration::from_secs(30));
        assert_eq!(built.steps[1].timeout, Duration::from_secs(5));

        let loaded = orchestrator
            .get_saga(built.instance.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.business_id(), "PAY-1");
        assert_eq!(loaded.metadata()["amount"], 1000);
    }

    #[tokio::test]
    async fn metadata_is_shallow_merged() {
        let mut first = Map::new();
        first.insert("currency".into(), Value::from("USD"));
        first.insert("amount".into(), Value::from(100));
        let mut second = Map::new();
        second.insert("amount".into(), Value::from(250));

        let built = orchestrator()
            .saga_builder("PAY-2", "payment")
            .unwrap()
            .set_metadata(first)
            .set_metadata(second)
            .build()
            .await
            .unwrap();

        let metadata = built.instance.metadata();
        assert_eq!(metadata["currency"], "USD");
        assert_eq!(metadata["amount"], 250);
    }

    #[tokio::test]
    async fn duplicate_step_names_fail_at_build() {
        let result = orchestrator()
            .saga_builder("PAY-3", "payment")
            .unwrap()
            .add_step("A", Arc::new(Echo), 0)
            .add_step("A", Arc::new(Echo), 0)
            .build()
            .await;

        assert!(matches!(result, Err(SagaError::DuplicateStep(name)) if name == "A"));
    }
}
