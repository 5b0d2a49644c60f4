use super::{EngineError, EngineFactory, RenderEngine};

/// Owns at most one live engine instance.
///
/// The instance is created lazily on first `acquire`. A fatal fault marks the
/// slot poisoned; the next `acquire` tears the instance down and starts a
/// fresh one instead of handing the poisoned instance back out. `generation`
/// changes every time a new instance starts, which tells callers that the
/// virtual file system was wiped.
pub struct EngineSlot<F: EngineFactory> {
    factory: F,
    instance: Option<F::Engine>,
    poisoned: bool,
    generation: u64,
    recycles: u64,
}

impl<F: EngineFactory> EngineSlot<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            instance: None,
            poisoned: false,
            generation: 0,
            recycles: 0,
        }
    }

    pub async fn acquire(&mut self) -> Result<&mut F::Engine, EngineError> {
        if self.poisoned {
            log::warn!("engine generation {} poisoned, reinitializing", self.generation);
            self.recycle().await?;
        }
        if self.instance.is_none() {
            self.start().await?;
        }
        self.instance
            .as_mut()
            .ok_or_else(|| EngineError::Spawn("engine unavailable after start".to_string()))
    }

    /// Flag the live instance as unusable after a fatal fault.
    pub fn mark_poisoned(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Tear down the live instance (if any) and start a fresh one.
    pub async fn recycle(&mut self) -> Result<(), EngineError> {
        self.teardown().await;
        self.recycles += 1;
        self.poisoned = false;
        self.start().await
    }

    /// Tear down without starting a replacement.
    pub async fn release(&mut self) {
        self.teardown().await;
        self.poisoned = false;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn recycle_count(&self) -> u64 {
        self.recycles
    }

    #[cfg(test)]
    pub(crate) fn instance(&self) -> Option<&F::Engine> {
        self.instance.as_ref()
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        let next = self.generation + 1;
        let engine = self.factory.create(next).await?;
        self.generation = next;
        self.instance = Some(engine);
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(mut engine) = self.instance.take() {
            engine.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFactory, MockScript};

    #[tokio::test]
    async fn test_acquire_is_lazy_and_reuses_instance() {
        let script = MockScript::shared();
        let mut slot = EngineSlot::new(MockFactory::new(script.clone()));
        assert_eq!(slot.generation(), 0);
        assert_eq!(script.lock().unwrap().created, 0);

        slot.acquire().await.unwrap();
        slot.acquire().await.unwrap();
        assert_eq!(slot.generation(), 1);
        assert_eq!(script.lock().unwrap().created, 1);
        assert_eq!(slot.recycle_count(), 0);
    }

    #[tokio::test]
    async fn test_poisoned_slot_reinitializes_before_next_use() {
        let script = MockScript::shared();
        let mut slot = EngineSlot::new(MockFactory::new(script.clone()));
        slot.acquire().await.unwrap();

        slot.mark_poisoned();
        assert!(slot.is_poisoned());
        slot.acquire().await.unwrap();

        assert!(!slot.is_poisoned());
        assert_eq!(slot.generation(), 2);
        assert_eq!(slot.recycle_count(), 1);
        let s = script.lock().unwrap();
        assert_eq!(s.created, 2);
        assert_eq!(s.shutdowns, 1);
    }

    #[tokio::test]
    async fn test_failed_start_surfaces_error() {
        let script = MockScript::shared();
        script.lock().unwrap().fail_create = true;
        let mut slot = EngineSlot::new(MockFactory::new(script));
        assert!(slot.acquire().await.is_err());
        assert_eq!(slot.generation(), 0);
    }
}
