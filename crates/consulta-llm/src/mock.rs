use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use consulta_core::errors::ResponderError;
use consulta_core::responder::{ChatTurn, Responder};

/// Pre-programmed outcomes for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(ResponderError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// A call the mock received.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub prompt: String,
    pub history: Vec<ChatTurn>,
}

/// Responder that returns pre-programmed replies in sequence.
pub struct MockResponder {
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockResponder {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Responder for MockResponder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, prompt: &str, history: &[ChatTurn]) -> Result<String, ResponderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(RecordedCall {
            prompt: prompt.to_string(),
            history: history.to_vec(),
        });

        let Some(reply) = self.replies.get(idx) else {
            return Err(ResponderError::InvalidRequest(format!(
                "MockResponder: no reply configured for call {idx}"
            )));
        };
        resolve(reply).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(reply: &MockReply) -> Result<String, ResponderError> {
    let mut current = reply;
    loop {
        match current {
            MockReply::Text(text) => return Ok(text.clone()),
            MockReply::Error(e) => return Err(e.clone()),
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner.as_ref();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_in_sequence() {
        let mock = MockResponder::new(vec![
            MockReply::text("uno"),
            MockReply::Error(ResponderError::ModelUnavailable("down".into())),
        ]);
        assert_eq!(mock.generate("a", &[]).await.unwrap(), "uno");
        assert!(matches!(
            mock.generate("b", &[]).await,
            Err(ResponderError::ModelUnavailable(_))
        ));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let mock = MockResponder::new(vec![]);
        assert!(matches!(
            mock.generate("a", &[]).await,
            Err(ResponderError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn records_prompt_and_history() {
        let mock = MockResponder::new(vec![MockReply::text("ok")]);
        mock.generate("pregunta", &[ChatTurn::user("hola")]).await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls[0].prompt, "pregunta");
        assert_eq!(calls[0].history, vec![ChatTurn::user("hola")]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_waits() {
        let mock = MockResponder::new(vec![MockReply::delayed(
            Duration::from_secs(5),
            MockReply::text("tarde"),
        )]);
        let start = tokio::time::Instant::now();
        assert_eq!(mock.generate("a", &[]).await.unwrap(), "tarde");
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
