use async_trait::async_trait;

use crate::error::Result;

/// A text-in, text-out language model service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}
