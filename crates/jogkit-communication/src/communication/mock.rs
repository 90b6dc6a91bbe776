//! Simulated GRBL controller
//!
//! `MockDevice` keeps a machine position and status, answers commands the
//! way GRBL does and records everything it receives. Tests script faults
//! on it: rejected lines, silent lines (to force timeouts), failed homing,
//! link drops and failed opens. `MockTransportFactory` hands out
//! transports bound to one device.

use async_trait::async_trait;
use jogkit_core::{Axis, ConnectionError, MachineStatus, Position, WcsSlot};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{Transport, TransportFactory};
use crate::firmware::grbl::commands::{
    realtime_name, CYCLE_START, FEED_HOLD, JOG_CANCEL, SOFT_RESET, STATUS_QUERY,
};
use crate::firmware::grbl::response_parser::format_status_report;

/// Something the device received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    /// A command line
    Line(String),
    /// A real-time byte
    Realtime(u8),
}

impl std::fmt::Display for SentFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentFrame::Line(line) => f.write_str(line),
            SentFrame::Realtime(byte) => f.write_str(&realtime_name(*byte)),
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    position: Position,
    status: MachineStatus,
    active_wcs: WcsSlot,
    offsets: [Position; 6],
    received: Vec<SentFrame>,
    outbox: VecDeque<String>,
    rejections: VecDeque<(String, u8)>,
    silent_lines: usize,
    failing_homes: HashSet<Axis>,
    link: u64,
    link_up: bool,
    failed_opens: usize,
    open_delay: Duration,
    opens: usize,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            position: Position::ORIGIN,
            status: MachineStatus::Idle,
            active_wcs: WcsSlot::G54,
            offsets: [Position::ORIGIN; 6],
            received: Vec::new(),
            outbox: VecDeque::new(),
            rejections: VecDeque::new(),
            silent_lines: 0,
            failing_homes: HashSet::new(),
            link: 0,
            link_up: false,
            failed_opens: 0,
            open_delay: Duration::ZERO,
            opens: 0,
        }
    }
}

impl DeviceState {
    fn offset(&self, slot: WcsSlot) -> Position {
        self.offsets[slot.number() as usize - 1]
    }

    fn status_line(&self) -> String {
        format_status_report(self.status, &self.position, &self.offset(self.active_wcs))
    }

    fn handle_line(&mut self, line: &str) {
        self.received.push(SentFrame::Line(line.to_string()));

        if self.silent_lines > 0 {
            self.silent_lines -= 1;
            return;
        }

        if let Some(index) = self
            .rejections
            .iter()
            .position(|(prefix, _)| line.starts_with(prefix.as_str()))
        {
            if let Some((_, code)) = self.rejections.remove(index) {
                self.outbox.push_back(format!("error:{}", code));
            }
            return;
        }

        let reply = self.execute(line);
        self.outbox.push_back(reply);
    }

    fn execute(&mut self, line: &str) -> String {
        let locked = self.status == MachineStatus::Alarm;

        if line == "$X" {
            self.status = MachineStatus::Idle;
            self.outbox.push_back("[MSG:Caution: Unlocked]".to_string());
            return "ok".to_string();
        }

        if let Some(letters) = line.strip_prefix("$H") {
            return self.home(letters);
        }

        if let Some(words) = line.strip_prefix("$J=") {
            if locked {
                return "error:9".to_string();
            }
            return match parse_axis_words(words) {
                Some(words) => {
                    for (axis, value) in words {
                        self.position.set(axis, value);
                    }
                    "ok".to_string()
                }
                None => "error:16".to_string(),
            };
        }

        if let Some(slot) = line.parse::<WcsSlot>().ok().filter(|_| line.starts_with('G')) {
            self.active_wcs = slot;
            return "ok".to_string();
        }

        if let Some(rest) = line.strip_prefix("G10 ") {
            return self.set_offset(rest);
        }

        if locked {
            return "error:9".to_string();
        }
        "ok".to_string()
    }

    fn home(&mut self, letters: &str) -> String {
        let axes: Vec<Axis> = if letters.is_empty() {
            Axis::ALL.to_vec()
        } else {
            match letters.chars().map(Axis::try_from).collect::<Result<_, _>>() {
                Ok(axes) => axes,
                Err(_) => return "error:3".to_string(),
            }
        };

        for axis in axes {
            if self.failing_homes.contains(&axis) {
                self.status = MachineStatus::Alarm;
                self.outbox.push_back("ALARM:9".to_string());
                return "error:9".to_string();
            }
            self.position.set(axis, 0.0);
        }
        self.status = MachineStatus::Idle;
        "ok".to_string()
    }

    fn set_offset(&mut self, rest: &str) -> String {
        let mut tokens = rest.split_whitespace();
        let mode = tokens.next();
        let slot = tokens
            .next()
            .and_then(|p| p.strip_prefix('P'))
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(WcsSlot::from_number);
        let (Some(slot), Some(words)) = (slot, parse_axis_words(&tokens.collect::<Vec<_>>().join(" ")))
        else {
            return "error:28".to_string();
        };

        let index = slot.number() as usize - 1;
        for (axis, value) in words {
            let offset = match mode {
                Some("L20") => self.position.get(axis) - value,
                _ => value,
            };
            self.offsets[index].set(axis, offset);
        }
        "ok".to_string()
    }

    fn handle_realtime(&mut self, byte: u8) {
        self.received.push(SentFrame::Realtime(byte));
        match byte {
            STATUS_QUERY => {
                let line = self.status_line();
                self.outbox.push_back(line);
            }
            SOFT_RESET => {
                self.outbox.clear();
                self.status = MachineStatus::Alarm;
                self.outbox
                    .push_back("Grbl 1.1h ['$' for help]".to_string());
            }
            JOG_CANCEL if self.status == MachineStatus::Jog => {
                self.status = MachineStatus::Idle;
            }
            FEED_HOLD if self.status == MachineStatus::Run => {
                self.status = MachineStatus::Hold;
            }
            CYCLE_START if self.status == MachineStatus::Hold => {
                self.status = MachineStatus::Run;
            }
            _ => {}
        }
    }
}

/// Parse `G53 G21 X10 Y-2 F1000` into axis words; G and F words are skipped
fn parse_axis_words(words: &str) -> Option<Vec<(Axis, f64)>> {
    let mut parsed = Vec::new();
    for word in words.split_whitespace() {
        let mut chars = word.chars();
        let letter = chars.next()?;
        match letter.to_ascii_uppercase() {
            'G' | 'F' => continue,
            'X' | 'Y' | 'Z' => {
                let axis = Axis::try_from(letter).ok()?;
                let value = chars.as_str().parse::<f64>().ok()?;
                parsed.push((axis, value));
            }
            _ => return None,
        }
    }
    Some(parsed)
}

/// A simulated GRBL controller shared by every transport opened on it
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
    notify: Arc<Notify>,
}

impl MockDevice {
    /// Create an idle device at the origin
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that opens transports on this device
    pub fn factory(&self) -> MockTransportFactory {
        MockTransportFactory {
            device: self.clone(),
        }
    }

    /// Everything received, in order
    pub fn received(&self) -> Vec<SentFrame> {
        self.state.lock().received.clone()
    }

    /// Command lines received, in order
    pub fn lines(&self) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|frame| match frame {
                SentFrame::Line(line) => Some(line.clone()),
                SentFrame::Realtime(_) => None,
            })
            .collect()
    }

    /// Real-time bytes received, in order
    pub fn realtime_bytes(&self) -> Vec<u8> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|frame| match frame {
                SentFrame::Realtime(byte) => Some(*byte),
                SentFrame::Line(_) => None,
            })
            .collect()
    }

    /// Forget received frames
    pub fn clear_received(&self) {
        self.state.lock().received.clear();
    }

    /// Simulated machine position
    pub fn position(&self) -> Position {
        self.state.lock().position
    }

    /// Move the simulated machine
    pub fn set_position(&self, position: Position) {
        self.state.lock().position = position;
    }

    /// Simulated controller status
    pub fn status(&self) -> MachineStatus {
        self.state.lock().status
    }

    /// Force the simulated controller status
    pub fn set_status(&self, status: MachineStatus) {
        self.state.lock().status = status;
    }

    /// Emit an unsolicited line (e.g. `ALARM:1`)
    pub fn push_line(&self, line: impl Into<String>) {
        self.state.lock().outbox.push_back(line.into());
        self.notify.notify_waiters();
    }

    /// Answer the next line starting with `prefix` with `error:code`
    pub fn reject_next(&self, prefix: impl Into<String>, code: u8) {
        self.state.lock().rejections.push_back((prefix.into(), code));
    }

    /// Leave the next `count` lines unanswered
    pub fn ignore_next_lines(&self, count: usize) {
        self.state.lock().silent_lines += count;
    }

    /// Make homing of `axis` fail with `ALARM:9`
    pub fn fail_homing(&self, axis: Axis) {
        self.state.lock().failing_homes.insert(axis);
    }

    /// Break the current link; reads and writes fail until reopened
    pub fn drop_link(&self) {
        self.state.lock().link_up = false;
        self.notify.notify_waiters();
    }

    /// Whether a transport is currently linked
    pub fn is_linked(&self) -> bool {
        self.state.lock().link_up
    }

    /// Fail the next `count` open attempts
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().failed_opens += count;
    }

    /// Delay every open attempt
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// Number of open attempts so far
    pub fn open_attempts(&self) -> usize {
        self.state.lock().opens
    }
}

/// Opens `MockTransport`s on a `MockDevice`
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    device: MockDevice,
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn Transport>, ConnectionError> {
        let delay = {
            let mut state = self.device.state.lock();
            state.opens += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.device.state.lock();
        if state.failed_opens > 0 {
            state.failed_opens -= 1;
            return Err(ConnectionError::OpenFailed {
                port: port.to_string(),
                reason: "device not responding".to_string(),
            });
        }

        state.link += 1;
        state.link_up = true;
        state.outbox.clear();
        tracing::debug!("Mock device linked on {}", port);

        Ok(Box::new(MockTransport {
            port: port.to_string(),
            link: state.link,
            device: self.device.clone(),
        }))
    }
}

/// Transport bound to one link of a `MockDevice`
#[derive(Debug)]
pub struct MockTransport {
    port: String,
    link: u64,
    device: MockDevice,
}

impl MockTransport {
    fn broken() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "mock link dropped")
    }

    fn with_link<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> io::Result<R> {
        let mut state = self.device.state.lock();
        if !state.link_up || state.link != self.link {
            return Err(Self::broken());
        }
        Ok(f(&mut state))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn port(&self) -> &str {
        &self.port
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.with_link(|state| state.handle_line(line))?;
        self.device.notify.notify_waiters();
        Ok(())
    }

    async fn write_realtime(&mut self, byte: u8) -> io::Result<()> {
        self.with_link(|state| state.handle_realtime(byte))?;
        self.device.notify.notify_waiters();
        Ok(())
    }

    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            let notified = self.device.notify.notified();
            if let Some(line) = self.with_link(|state| state.outbox.pop_front())? {
                return Ok(line);
            }
            notified.await;
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut state = self.device.state.lock();
        if state.link == self.link {
            state.link_up = false;
        }
        Ok(())
    }
}
