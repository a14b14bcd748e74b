//! Hand-off to the content-enrichment pipeline
//!
//! Enrichment (attachment text extraction and the like) runs out of band.
//! Submitting never waits for it.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::models::{FolderKey, MailMessage, MessageId};

/// A message queued for enrichment
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub folder: FolderKey,
    pub id: MessageId,
    pub message: MailMessage,
}

impl ContentItem {
    pub fn new(message: &MailMessage) -> Self {
        Self {
            folder: message.folder_key(),
            id: message.id.clone(),
            message: message.clone(),
        }
    }
}

/// Fire-and-forget sink for enrichment work
pub trait ContentSink: Send + Sync {
    /// Queue a message; must not block on enrichment
    fn submit(&self, item: ContentItem);

    /// Ask the sink to hand over whatever it buffered; must not block either
    fn flush(&self);
}

/// Sink that drops everything
#[derive(Debug, Default)]
pub struct NoopContentSink;

impl ContentSink for NoopContentSink {
    fn submit(&self, _item: ContentItem) {}

    fn flush(&self) {}
}

enum SinkCommand {
    Item(ContentItem),
    Flush,
}

/// Sink that batches items and hands them to a handler on its own thread
pub struct ChannelContentSink {
    sender: Mutex<Option<Sender<SinkCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelContentSink {
    /// Start the background thread
    ///
    /// `handler` receives batches of at most `batch_size` items, plus a
    /// partial batch on every flush and on close.
    pub fn spawn<F>(batch_size: usize, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(Vec<ContentItem>) + Send + 'static,
    {
        let batch_size = batch_size.max(1);
        let (sender, receiver) = mpsc::channel::<SinkCommand>();

        let worker = std::thread::Builder::new()
            .name("content-sink".to_string())
            .spawn(move || {
                let mut buffer = Vec::with_capacity(batch_size);
                for command in receiver {
                    match command {
                        SinkCommand::Item(item) => {
                            buffer.push(item);
                            if buffer.len() >= batch_size {
                                handler(std::mem::take(&mut buffer));
                            }
                        }
                        SinkCommand::Flush if !buffer.is_empty() => {
                            handler(std::mem::take(&mut buffer));
                        }
                        SinkCommand::Flush => {}
                    }
                }
                if !buffer.is_empty() {
                    handler(buffer);
                }
                debug!("Content sink stopped");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn send(&self, command: SinkCommand) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(command).is_err() {
                    warn!("Content sink thread is gone, dropping item");
                }
            }
            None => debug!("Content sink closed, dropping item"),
        }
    }

    /// Stop accepting items, hand over the rest and wait for the thread
    pub fn close(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            warn!("Content sink thread panicked");
        }
    }
}

impl ContentSink for ChannelContentSink {
    fn submit(&self, item: ContentItem) {
        self.send(SinkCommand::Item(item));
    }

    fn flush(&self) {
        self.send(SinkCommand::Flush);
    }
}

impl Drop for ChannelContentSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MailboxKey;
    use std::sync::Arc;

    fn item(id: &str) -> ContentItem {
        let folder = MailboxKey::new(1, 1, 0).folder("INBOX");
        ContentItem::new(&MailMessage::builder(&folder, id).build())
    }

    #[test]
    fn test_batches_and_flushes() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&batches);
        let sink = ChannelContentSink::spawn(2, move |batch: Vec<ContentItem>| {
            seen.lock()
                .push(batch.iter().map(|i| i.id.to_string()).collect::<Vec<_>>());
        })
        .unwrap();

        sink.submit(item("1"));
        sink.submit(item("2"));
        sink.submit(item("3"));
        sink.flush();
        sink.submit(item("4"));
        sink.close();

        let batches = batches.lock();
        assert_eq!(
            *batches,
            vec![
                vec!["1".to_string(), "2".to_string()],
                vec!["3".to_string()],
                vec!["4".to_string()],
            ]
        );
    }

    #[test]
    fn test_submit_after_close_is_dropped() {
        let sink = ChannelContentSink::spawn(10, |_batch| {}).unwrap();
        sink.close();
        sink.submit(item("late"));
        sink.flush();
    }
}
