//! Bounded in-memory scrollback with lossy fan-out.
//!
//! Each managed process owns one `LogBuffer`. The PTY reader feeds it
//! sanitized bytes; the dashboard reads snapshots and subscribes for new
//! lines. The log file on disk is the durable record, so a subscriber
//! that falls behind simply loses lines rather than stalling the reader.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Default number of completed lines kept in the ring.
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Capacity of each subscriber channel.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Thread-safe ring buffer of completed log lines.
///
/// `write` splits incoming bytes on `\n`: complete lines enter the ring
/// and go out to subscribers, the fragment after the last newline stays
/// as a partial line until more bytes or a `flush` arrive. When the ring
/// is full the oldest line is evicted.
pub struct LogBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    lines: VecDeque<String>,
    max_lines: usize,
    total: u64,
    partial: String,
    subs: Vec<Subscriber>,
    next_sub_id: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// A live feed of lines appended after the subscription was taken.
///
/// Pass `id` to [`LogBuffer::unsubscribe`] to deregister, then drop the
/// receiver; the buffer side needs no further coordination.
pub struct LogSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        let max_lines = if max_lines == 0 {
            DEFAULT_MAX_LINES
        } else {
            max_lines
        };
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(256),
                max_lines,
                total: 0,
                partial: String::new(),
                subs: Vec::new(),
                next_sub_id: 0,
            }),
        }
    }

    /// Appends bytes to the buffer. Always consumes the whole input and
    /// returns its length; sink failures are not a producer concern.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut inner = self.lock();

        let text = String::from_utf8_lossy(data);
        let combined = format!("{}{}", std::mem::take(&mut inner.partial), text);

        let mut parts: Vec<&str> = combined.split('\n').collect();
        // The final element is either "" (input ended with \n) or an
        // unterminated fragment that becomes the new partial.
        let last = parts.pop().unwrap_or_default();
        for line in parts {
            inner.append_line(line.to_string());
        }
        if !last.is_empty() {
            inner.partial = last.to_string();
        }

        data.len()
    }

    /// Promotes the partial line, if any, to a completed line. Called on
    /// child exit so a trailing prompt is preserved in the scrollback.
    pub fn flush(&self) {
        let mut inner = self.lock();
        if !inner.partial.is_empty() {
            let partial = std::mem::take(&mut inner.partial);
            inner.append_line(partial);
        }
    }

    /// Registers a new subscriber. Only lines appended after this call
    /// are delivered; lines are dropped for this subscriber whenever its
    /// channel is full.
    pub fn subscribe(&self) -> LogSubscription {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subs.push(Subscriber { id, tx });
        LogSubscription { id, rx }
    }

    /// Removes a subscriber from the registry. Lines already queued stay
    /// receivable; publishes racing with the removal are simply dropped,
    /// so the reader task never has to coordinate with unsubscription.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().subs.retain(|sub| sub.id != id);
    }

    /// All buffered lines, with the partial line (if any) as a trailing
    /// element so interactive prompts are visible.
    pub fn lines(&self) -> Vec<String> {
        let inner = self.lock();
        let mut out: Vec<String> = inner.lines.iter().cloned().collect();
        if !inner.partial.is_empty() {
            out.push(inner.partial.clone());
        }
        out
    }

    /// The last `n` completed lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    /// All lines joined by `\n`, partial line included. Used to seed a
    /// viewport when the dashboard attaches to a session.
    pub fn content(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        for (i, line) in inner.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        if !inner.partial.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&inner.partial);
        }
        out
    }

    /// Number of completed lines currently buffered.
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic count of lines ever appended, including evicted ones.
    pub fn total_lines(&self) -> u64 {
        self.lock().total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn append_line(&mut self, line: String) {
        if self.lines.len() >= self.max_lines {
            self.lines.pop_front();
        }
        for sub in &self.subs {
            // Non-blocking: a full or abandoned channel drops the line
            // for that subscriber only.
            let _ = sub.tx.try_send(line.clone());
        }
        self.lines.push_back(line);
        self.total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_writes_into_lines() {
        let buf = LogBuffer::new(100);
        buf.write(b"hello\nwor");
        buf.write(b"ld\n");
        assert_eq!(buf.lines(), vec!["hello", "world"]);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_line_visible_until_flushed() {
        let buf = LogBuffer::new(100);
        buf.write(b"enter name: ");
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.lines(), vec!["enter name: "]);
        assert_eq!(buf.content(), "enter name: ");

        buf.flush();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.lines(), vec!["enter name: "]);
    }

    #[test]
    fn cr_overwrites_become_separate_lines() {
        use crate::process::sanitize::sanitize_for_log;

        let buf = LogBuffer::new(100);
        buf.write(&sanitize_for_log(
            b"progress: 10%\rprogress: 20%\rprogress: 30%\n",
        ));
        assert_eq!(
            buf.lines(),
            vec!["progress: 10%", "progress: 20%", "progress: 30%"]
        );
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.write(format!("line{i}\n").as_bytes());
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.lines(), vec!["line2", "line3", "line4"]);
        assert_eq!(buf.total_lines(), 5);
    }

    #[test]
    fn content_joins_lines_and_partial() {
        let buf = LogBuffer::new(100);
        buf.write(b"a\nb\nc");
        assert_eq!(buf.content(), "a\nb\nc");
    }

    #[test]
    fn tail_returns_last_n_completed() {
        let buf = LogBuffer::new(100);
        buf.write(b"1\n2\n3\n4\ntrailing");
        assert_eq!(buf.tail(2), vec!["3", "4"]);
        assert_eq!(buf.tail(10), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn subscriber_sees_only_new_lines() {
        let buf = LogBuffer::new(100);
        buf.write(b"before\n");

        let mut sub = buf.subscribe();
        buf.write(b"after\n");

        assert_eq!(sub.rx.try_recv().unwrap(), "after");
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_keeps_queued_lines_receivable() {
        let buf = LogBuffer::new(100);
        let mut sub = buf.subscribe();
        buf.write(b"one\n");
        buf.unsubscribe(sub.id);
        buf.write(b"two\n");

        // The line queued before unsubscription is still there; the one
        // written after it never arrives.
        assert_eq!(sub.rx.try_recv().unwrap(), "one");
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn slow_subscriber_never_blocks_the_producer() {
        let buf = LogBuffer::new(DEFAULT_MAX_LINES);
        let mut sub = buf.subscribe();

        for i in 0..10_000 {
            buf.write(format!("line{i}\n").as_bytes());
        }

        assert_eq!(buf.len(), 10_000);
        // The channel holds exactly its capacity; everything else was
        // dropped for this subscriber.
        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 256);
    }

    #[test]
    fn dropped_lines_do_not_affect_other_subscribers() {
        let buf = LogBuffer::new(100);
        let mut slow = buf.subscribe();
        let mut fast = buf.subscribe();

        for i in 0..300 {
            buf.write(format!("{i}\n").as_bytes());
            // The fast subscriber keeps up.
            assert_eq!(fast.rx.try_recv().unwrap(), i.to_string());
        }

        let mut slow_received = 0;
        while slow.rx.try_recv().is_ok() {
            slow_received += 1;
        }
        assert_eq!(slow_received, 256);
    }
}
