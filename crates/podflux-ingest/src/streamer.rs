use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use podflux_types::{OutputRecord, WorkloadIdentity};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::enrich::enrich_line;

/// Reads one container's log stream and emits enriched records until
/// cancelled or the stream ends.
///
/// Open and read failures are logged and terminate the streamer without
/// retry; the watcher starts a replacement on the next eligible pod event.
pub struct ContainerStreamer {
    client: kube::Client,
    identity: WorkloadIdentity,
    output: mpsc::Sender<OutputRecord>,
    cancel: CancellationToken,
    tail_lines: Option<i64>,
    since_seconds: Option<i64>,
}

impl ContainerStreamer {
    /// `cancel` must be a child of the watcher's root token so the watcher
    /// can stop this stream individually or tear everything down at once.
    pub fn new(
        client: kube::Client,
        identity: WorkloadIdentity,
        output: mpsc::Sender<OutputRecord>,
        cancel: CancellationToken,
        tail_lines: Option<i64>,
        since_seconds: Option<i64>,
    ) -> Self {
        Self {
            client,
            identity,
            output,
            cancel,
            tail_lines,
            since_seconds,
        }
    }

    pub async fn run(self) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.identity.namespace);

        let params = LogParams {
            follow: true,
            timestamps: true,
            container: Some(self.identity.container.clone()),
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
            ..Default::default()
        };

        let stream = match api.log_stream(&self.identity.pod, &params).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    namespace = %self.identity.namespace,
                    pod = %self.identity.pod,
                    container = %self.identity.container,
                    %error,
                    "failed to open log stream"
                );
                return;
            }
        };

        // The line buffer grows with the line, so oversized single lines
        // (structured logs well past 1 MiB) come through untruncated.
        let mut lines = stream.lines();

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = lines.try_next() => match next {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::debug!(
                            namespace = %self.identity.namespace,
                            pod = %self.identity.pod,
                            container = %self.identity.container,
                            "log stream ended"
                        );
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(
                            namespace = %self.identity.namespace,
                            pod = %self.identity.pod,
                            container = %self.identity.container,
                            %error,
                            "error reading log stream"
                        );
                        return;
                    }
                },
            };

            if line.is_empty() {
                continue;
            }

            let record = enrich_line(&line, &self.identity);
            if !send_or_cancelled(&self.output, record, &self.cancel).await {
                return;
            }
        }
    }
}

/// Cancellation-aware send into the bounded output channel, so a stalled
/// consumer cannot deadlock a shutdown. Returns `false` when the send was
/// abandoned (cancellation) or the channel is closed.
pub(crate) async fn send_or_cancelled(
    output: &mpsc::Sender<OutputRecord>,
    record: OutputRecord,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = output.send(record) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(body: &str) -> OutputRecord {
        OutputRecord::new(body, Vec::new())
    }

    #[tokio::test]
    async fn send_succeeds_with_capacity() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        assert!(send_or_cancelled(&tx, record("hello"), &cancel).await);
        assert_eq!(rx.recv().await.unwrap().body.string_value, "hello");
    }

    #[tokio::test]
    async fn blocked_send_unblocks_on_cancellation() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(record("filler")).await.unwrap();

        let cancel = CancellationToken::new();
        let sender = tx.clone();
        let child = cancel.child_token();
        let task = tokio::spawn(async move {
            send_or_cancelled(&sender, record("stuck"), &child).await
        });

        // The channel is full and nobody is draining it; only cancellation
        // can release the send.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        let sent = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("send must unblock after cancellation")
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let cancel = CancellationToken::new();
        assert!(!send_or_cancelled(&tx, record("orphan"), &cancel).await);
    }
}
