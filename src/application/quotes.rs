use crate::domain::models::{ChatMessage, ChatRequest};
use crate::infrastructure::chat_client::ChatCompletionClient;
use crate::infrastructure::config::AssistantSettings;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Look-ahead queue of motivational quotes fetched from the model.
///
/// Consuming a quote spawns a background top-up, so the next call is usually
/// served from memory. Fetch failures are logged and swallowed.
pub struct QuoteCache<C>
where
    C: ChatCompletionClient + ?Sized + 'static,
{
    client: Arc<C>,
    model: String,
    prompt: String,
    target_size: usize,
    queue: Arc<Mutex<VecDeque<String>>>,
}

impl<C> QuoteCache<C>
where
    C: ChatCompletionClient + ?Sized + 'static,
{
    pub fn new(client: Arc<C>, settings: &AssistantSettings) -> Self {
        Self {
            client,
            model: settings.model.clone(),
            prompt: settings.quote_prompt.clone(),
            target_size: settings.quote_queue_size.max(1),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Fills an empty queue up to the target size. Stops at the first failed fetch.
    pub async fn initialize(&self) {
        let mut queue = self.queue.lock().await;
        if !queue.is_empty() {
            return;
        }
        while queue.len() < self.target_size {
            match fetch_quote(self.client.as_ref(), &self.model, &self.prompt).await {
                Some(quote) => queue.push_back(quote),
                None => break,
            }
        }
        debug!(queued = queue.len(), "quote cache initialized");
    }

    /// Next quote, or an empty string when the queue is dry and a direct
    /// fetch fails.
    pub async fn next_quote(&self) -> String {
        let mut queue = self.queue.lock().await;
        let Some(quote) = queue.pop_front() else {
            return fetch_quote(self.client.as_ref(), &self.model, &self.prompt)
                .await
                .unwrap_or_default();
        };
        drop(queue);

        let client = Arc::clone(&self.client);
        let queue = Arc::clone(&self.queue);
        let model = self.model.clone();
        let prompt = self.prompt.clone();
        let target_size = self.target_size;
        tokio::spawn(async move {
            let mut queue = queue.lock().await;
            if queue.len() >= target_size {
                return;
            }
            if let Some(quote) = fetch_quote(client.as_ref(), &model, &prompt).await {
                queue.push_back(quote);
            }
        });

        quote
    }
}

async fn fetch_quote<C>(client: &C, model: &str, prompt: &str) -> Option<String>
where
    C: ChatCompletionClient + ?Sized,
{
    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user(prompt)],
    };
    match client.send(&request).await {
        Ok(response) => response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|quote| !quote.is_empty()),
        Err(error) => {
            warn!(%error, "failed fetching quote");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeChatClient, FakeReply};
    use std::time::Duration;

    fn cache(client: FakeChatClient) -> (QuoteCache<FakeChatClient>, Arc<FakeChatClient>) {
        let client = Arc::new(client);
        (
            QuoteCache::new(Arc::clone(&client), &AssistantSettings::default()),
            client,
        )
    }

    async fn wait_for_queue(cache: &QuoteCache<FakeChatClient>, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while cache.queued().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue reached expected size");
    }

    #[tokio::test]
    async fn initialize_fills_to_target_and_consumption_refills() {
        let (cache, client) = cache(FakeChatClient::replying(&[" one ", "two", "three", "four"]));
        assert_eq!(cache.target_size(), 3);

        cache.initialize().await;
        assert_eq!(cache.queued().await, 3);
        assert_eq!(client.requests().len(), 3);
        assert_eq!(
            client.requests()[0].messages,
            vec![ChatMessage::user(AssistantSettings::default().quote_prompt)]
        );

        assert_eq!(cache.next_quote().await, "one");
        wait_for_queue(&cache, 3).await;
        assert_eq!(client.requests().len(), 4);

        cache.initialize().await;
        assert_eq!(client.requests().len(), 4, "non-empty queue is left alone");
    }

    #[tokio::test]
    async fn dry_queue_fetches_directly_and_failures_yield_empty() {
        let (cache, _client) = cache(FakeChatClient::with_replies(vec![
            FakeReply::Content("Do it now".to_string()),
        ]));

        assert_eq!(cache.next_quote().await, "Do it now");
        assert_eq!(cache.next_quote().await, "");
        assert_eq!(cache.queued().await, 0);
    }

    #[tokio::test]
    async fn failed_refill_leaves_queue_short() {
        let (cache, client) = cache(FakeChatClient::with_replies(vec![
            FakeReply::Content("first".to_string()),
            FakeReply::NoChoices,
        ]));

        cache.initialize().await;
        assert_eq!(cache.queued().await, 1);

        assert_eq!(cache.next_quote().await, "first");
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.requests().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("refill attempted");
        assert_eq!(cache.queued().await, 0);
    }
}
