//! ビルド進捗イベントの集約
//!
//! ビルドエンジンの進捗イベントを別タスクで受け取り、到着順の
//! 1本のトランスクリプトにまとめる。
//!
//! 終了は二段階で行う:
//! 1. 送信側 ([`ProgressSender::close`]) を閉じる。エンジン側が先に閉じていても問題ない
//! 2. [`ProgressCollector::finish`] でチャネルが閉じきるまで待ち、トランスクリプトを受け取る

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 256;

/// ビルドエンジンから届く進捗イベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// ビルドステップ (vertex) の識別子
    pub vertex: String,
    pub name: Option<String>,
    pub stream: i64,
    pub data: Vec<u8>,
}

impl LogEvent {
    /// vertex 名の通知
    pub fn vertex_name(vertex: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            vertex: vertex.into(),
            name: Some(name.into()),
            stream: 0,
            data: Vec::new(),
        }
    }

    /// ログ出力のチャンク
    pub fn chunk(vertex: impl Into<String>, stream: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            vertex: vertex.into(),
            name: None,
            stream,
            data: data.into(),
        }
    }
}

/// 進捗イベントからトランスクリプトを組み立てる
#[derive(Debug, Default)]
pub struct BuildProgress {
    names: HashMap<String, String>,
    lines: Vec<String>,
}

impl BuildProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: LogEvent) {
        // 最初に届いた空でない名前を採用する
        if let Some(name) = event.name.filter(|n| !n.is_empty()) {
            self.names.entry(event.vertex.clone()).or_insert(name);
        }

        let text = String::from_utf8_lossy(&event.data);
        let content = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
        if content.is_empty() {
            return;
        }

        // 名前が未確定の間は識別子をそのまま使う
        let label = self
            .names
            .get(&event.vertex)
            .map(String::as_str)
            .unwrap_or(&event.vertex);
        let line = format!("[{}][stream:{}] {}", label, event.stream, content);
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn transcript(&self) -> String {
        self.lines.join("\n")
    }
}

/// 進捗イベントの送信側
///
/// クローンはエンジン側に渡す。全てのクローンが閉じる (drop される) と
/// 集約タスクが終了する。
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<LogEvent>>,
}

impl ProgressSender {
    /// イベントを送信する。集約側が既に終了していれば `false`
    pub async fn send(&self, event: LogEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// この送信側を閉じる。既に閉じていれば何もしない
    pub fn close(&mut self) {
        if self.tx.take().is_none() {
            tracing::trace!("Progress sender already closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// 集約タスクのハンドル
#[derive(Debug)]
pub struct ProgressCollector {
    handle: JoinHandle<BuildProgress>,
}

impl ProgressCollector {
    /// チャネルが閉じるまで待ち、集約済みのトランスクリプトを返す
    pub async fn finish(self) -> String {
        match self.handle.await {
            Ok(progress) => progress.transcript(),
            Err(e) => {
                tracing::error!("Build log collector stopped unexpectedly: {}", e);
                String::new()
            }
        }
    }
}

/// 集約タスクを起動する
pub fn spawn_collector() -> (ProgressSender, ProgressCollector) {
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

    let handle = tokio::spawn(async move {
        let mut progress = BuildProgress::new();
        while let Some(event) = rx.recv().await {
            progress.observe(event);
        }
        progress
    });

    (ProgressSender { tx: Some(tx) }, ProgressCollector { handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_resolved_after_chunks() {
        let mut progress = BuildProgress::new();
        progress.observe(LogEvent::chunk("sha256:abc", 1, "first\n"));
        progress.observe(LogEvent::chunk("sha256:abc", 1, "second\n"));
        progress.observe(LogEvent::vertex_name("sha256:abc", "[1/2] RUN make"));
        progress.observe(LogEvent::chunk("sha256:abc", 2, "third\n"));

        assert_eq!(
            progress.lines(),
            &[
                "[sha256:abc][stream:1] first".to_string(),
                "[sha256:abc][stream:1] second".to_string(),
                "[[1/2] RUN make][stream:2] third".to_string(),
            ]
        );
    }

    #[test]
    fn test_first_name_wins() {
        let mut progress = BuildProgress::new();
        progress.observe(LogEvent::vertex_name("v1", ""));
        progress.observe(LogEvent::vertex_name("v1", "FROM alpine"));
        progress.observe(LogEvent::vertex_name("v1", "renamed"));
        progress.observe(LogEvent::chunk("v1", 1, "pulled"));

        assert_eq!(progress.transcript(), "[FROM alpine][stream:1] pulled");
    }

    #[test]
    fn test_empty_chunks_are_skipped() {
        let mut progress = BuildProgress::new();
        progress.observe(LogEvent::chunk("v1", 1, ""));
        progress.observe(LogEvent::chunk("v1", 1, "\n"));
        progress.observe(LogEvent::chunk("v1", 1, "\r\n\n"));
        progress.observe(LogEvent::vertex_name("v1", "step"));

        assert!(progress.lines().is_empty());
        assert_eq!(progress.transcript(), "");
    }

    #[test]
    fn test_only_trailing_newline_is_trimmed() {
        let mut progress = BuildProgress::new();
        progress.observe(LogEvent::chunk("v1", 1, "  indented\tvalue  \n"));
        assert_eq!(progress.transcript(), "[v1][stream:1]   indented\tvalue  ");
    }

    #[tokio::test]
    async fn test_collector_drains_after_close() {
        let (mut sender, collector) = spawn_collector();
        let engine = sender.clone();

        let producer = tokio::spawn(async move {
            for i in 0..10 {
                engine
                    .send(LogEvent::chunk("v1", 1, format!("line {}\n", i)))
                    .await;
            }
            // エンジン側のクローズ
            drop(engine);
        });

        producer.await.unwrap();
        sender.close();
        // 二重クローズは無害
        sender.close();
        assert!(sender.is_closed());

        let transcript = collector.finish().await;
        let lines: Vec<&str> = transcript.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "[v1][stream:1] line 0");
        assert_eq!(lines[9], "[v1][stream:1] line 9");
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (mut sender, collector) = spawn_collector();
        sender.close();
        assert!(!sender.send(LogEvent::chunk("v1", 1, "late")).await);
        assert_eq!(collector.finish().await, "");
    }
}
