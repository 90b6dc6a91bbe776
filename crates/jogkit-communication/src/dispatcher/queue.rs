//! Priority queue of pending commands
//!
//! Ordering is priority-major and FIFO within a tier. Each command gets a
//! monotonically increasing sequence number on push so that equal
//! priorities pop in arrival order.

use jogkit_core::Priority;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::command::Command;

struct Entry {
    priority: Priority,
    seq: Reverse<u64>,
    command: Command,
}

impl Entry {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.priority, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Pending commands, highest priority first
#[derive(Default)]
pub struct CommandQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a command behind every queued command of the same priority
    pub fn push(&mut self, command: Command) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority: command.priority,
            seq: Reverse(seq),
            command,
        });
    }

    /// Remove the next command to dispatch
    pub fn pop(&mut self) -> Option<Command> {
        self.heap.pop().map(|entry| entry.command)
    }

    /// Priority of the next command to dispatch
    pub fn peek_priority(&self) -> Option<Priority> {
        self.heap.peek().map(|entry| entry.priority)
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Check if a command with `tag` is queued
    pub fn contains_tag(&self, tag: &str) -> bool {
        self.heap.iter().any(|entry| entry.command.tag == Some(tag))
    }

    /// Remove every command matching `predicate`, in dispatch order
    pub fn drain_where(&mut self, mut predicate: impl FnMut(&Command) -> bool) -> Vec<Command> {
        let (mut removed, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|entry| predicate(&entry.command));
        self.heap = kept.into();
        removed.sort_by(|a, b| b.cmp(a));
        removed.into_iter().map(|entry| entry.command).collect()
    }

    /// Remove every command, in dispatch order
    pub fn drain_all(&mut self) -> Vec<Command> {
        self.drain_where(|_| true)
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("len", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(commands: Vec<Command>) -> Vec<String> {
        commands.iter().map(Command::text).collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = CommandQueue::new();
        queue.push(Command::line("a"));
        queue.push(Command::line("b").priority(Priority::Low));
        queue.push(Command::line("c"));
        queue.push(Command::line("d").priority(Priority::Emergency));
        queue.push(Command::line("e").priority(Priority::High));

        assert_eq!(queue.peek_priority(), Some(Priority::Emergency));
        assert_eq!(texts(queue.drain_all()), vec!["d", "e", "a", "c", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_where_keeps_the_rest() {
        let mut queue = CommandQueue::new();
        queue.push(Command::line("jog1").tag("jog"));
        queue.push(Command::line("G0 X1"));
        queue.push(Command::line("jog2").tag("jog"));

        assert!(queue.contains_tag("jog"));
        let removed = queue.drain_where(|c| c.tag == Some("jog"));
        assert_eq!(texts(removed), vec!["jog1", "jog2"]);
        assert!(!queue.contains_tag("jog"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().map(|c| c.text()), Some("G0 X1".to_string()));
    }
}
