//! Matching command responses to the commands that caused them.
//!
//! At most one command is in flight per connection. Its response is every
//! `ResponseValue` frame carrying its request id. With multi-part collection
//! enabled, an empty `ResponseValue` frame with the next id is sent right
//! behind the command; the server answers frames in order, so the echo of
//! that sentinel marks the end of the response.
//!
//! Frames with request id 0 are unsolicited console output. Anything else
//! that matches nothing is a late reply to a command that already timed out.

use log::{debug, warn};
use protocol::{Packet, PacketType, ServerId};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::CommandError;

/// Request id the server uses for console output.
pub const CONSOLE_ID: i32 = 0;

pub type Reply = oneshot::Sender<Result<String, CommandError>>;

/// A command waiting to be sent.
#[derive(Debug)]
pub struct CommandRequest {
    pub text: String,
    pub timeout: Duration,
    /// Counted from when the caller issued the command, not from when it
    /// reached the head of the queue.
    pub deadline: Instant,
    /// `None` for internal liveness probes.
    pub reply: Option<Reply>,
}

impl CommandRequest {
    pub fn new(text: impl Into<String>, timeout: Duration) -> (Self, oneshot::Receiver<Result<String, CommandError>>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            text: text.into(),
            timeout,
            deadline: Instant::now() + timeout,
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn probe(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            timeout,
            deadline: Instant::now() + timeout,
            reply: None,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.reply.is_none()
    }

    /// Resolves the caller with `err`. A caller that gave up is ignored.
    pub fn fail(self, err: CommandError) {
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(err));
        }
    }
}

#[derive(Debug)]
struct PendingCommand {
    request_id: i32,
    sentinel_id: Option<i32>,
    timeout: Duration,
    deadline: Instant,
    body: String,
    reply: Option<Reply>,
}

/// What a received frame turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Routed {
    /// Finished the in-flight command.
    Completed,
    /// Part of the in-flight command's response.
    Partial,
    /// Console output, to be parsed for events.
    Console(String),
    /// Matches nothing in flight.
    Late { id: i32 },
}

/// The in-flight command expired.
#[derive(Debug, PartialEq, Eq)]
pub struct Expired {
    pub request_id: i32,
    pub probe: bool,
}

#[derive(Debug)]
pub struct Correlator {
    server: ServerId,
    in_flight: Option<PendingCommand>,
    next_id: i32,
    multi_part: bool,
    max_command_len: usize,
}

impl Correlator {
    /// `first_id` seeds the id sequence; ids stay positive and skip 0.
    pub fn new(server: ServerId, first_id: i32, multi_part: bool) -> Self {
        Self {
            server,
            in_flight: None,
            next_id: first_id.clamp(1, i32::MAX),
            multi_part,
            max_command_len: protocol::MAX_PACKET_SIZE - protocol::MIN_PACKET_SIZE,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn in_flight(&self) -> usize {
        usize::from(self.in_flight.is_some())
    }

    /// Deadline of the in-flight command.
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|pending| pending.deadline)
    }

    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if self.next_id == i32::MAX { 1 } else { self.next_id + 1 };
        id
    }

    /// Starts `request` and returns the frames to write.
    ///
    /// Gives the request back if a command is already in flight. A command
    /// that cannot be framed, or whose deadline passed while it was queued,
    /// is failed right away and produces no frames.
    pub fn begin(&mut self, request: CommandRequest, now: Instant) -> Result<Vec<Packet>, CommandRequest> {
        if self.in_flight.is_some() {
            return Err(request);
        }

        if request.deadline <= now {
            debug!("{}: dropping queued command {}, deadline passed", self.server, request.text);
            let limit = request.timeout;
            request.fail(CommandError::TimedOut(limit));
            return Ok(Vec::new());
        }

        if request.text.contains('\0') {
            request.fail(CommandError::InvalidCommand("command contains a NUL byte".into()));
            return Ok(Vec::new());
        }
        if request.text.len() > self.max_command_len {
            let len = request.text.len();
            request.fail(CommandError::InvalidCommand(format!("command of {} bytes is too long", len)));
            return Ok(Vec::new());
        }

        let request_id = self.allocate_id();
        let mut packets = vec![Packet::command(request_id, &request.text)];

        let sentinel_id = if self.multi_part {
            let id = self.allocate_id();
            packets.push(Packet::response(id, ""));
            Some(id)
        } else {
            None
        };

        debug!("{}: sending command {} as id {}", self.server, request.text, request_id);
        self.in_flight = Some(PendingCommand {
            request_id,
            sentinel_id,
            timeout: request.timeout,
            deadline: request.deadline.min(now + request.timeout),
            body: String::new(),
            reply: request.reply,
        });

        Ok(packets)
    }

    /// Routes one received frame.
    pub fn on_packet(&mut self, packet: Packet) -> Routed {
        if packet.id == CONSOLE_ID && packet.kind == PacketType::ResponseValue {
            return Routed::Console(packet.body);
        }

        let (request_id, sentinel_id) = match &self.in_flight {
            Some(pending) => (pending.request_id, pending.sentinel_id),
            None => return Routed::Late { id: packet.id },
        };

        if packet.id == request_id {
            if let Some(pending) = self.in_flight.as_mut() {
                pending.body.push_str(&packet.body);
            }
            if sentinel_id.is_none() {
                self.complete();
                return Routed::Completed;
            }
            return Routed::Partial;
        }

        if Some(packet.id) == sentinel_id {
            self.complete();
            return Routed::Completed;
        }

        Routed::Late { id: packet.id }
    }

    fn complete(&mut self) {
        if let Some(pending) = self.in_flight.take() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Ok(pending.body));
            }
        }
    }

    /// Fails the in-flight command if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Expired> {
        match &self.in_flight {
            Some(pending) if pending.deadline <= now => {}
            _ => return None,
        }

        let pending = self.in_flight.take()?;
        let probe = pending.reply.is_none();
        warn!(
            "{}: command {} timed out after {:?}",
            self.server, pending.request_id, pending.timeout
        );
        if let Some(reply) = pending.reply {
            let _ = reply.send(Err(CommandError::TimedOut(pending.timeout)));
        }

        Some(Expired {
            request_id: pending.request_id,
            probe,
        })
    }

    /// Fails the in-flight command with `err`.
    pub fn fail(&mut self, err: CommandError) {
        if let Some(pending) = self.in_flight.take() {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator(multi_part: bool) -> Correlator {
        Correlator::new(ServerId::new("test"), 100, multi_part)
    }

    #[test]
    fn test_multi_part_sends_sentinel() {
        let mut c = correlator(true);
        let (request, _rx) = CommandRequest::new("status", Duration::from_secs(5));

        let packets = c.begin(request, Instant::now()).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], Packet::command(100, "status"));
        assert_eq!(packets[1], Packet::response(101, ""));
        assert_eq!(c.in_flight(), 1);
    }

    #[test]
    fn test_concatenates_until_sentinel() {
        let mut c = correlator(true);
        let (request, mut rx) = CommandRequest::new("users", Duration::from_secs(5));
        c.begin(request, Instant::now()).unwrap();

        assert_eq!(c.on_packet(Packet::response(100, "part one, ")), Routed::Partial);
        assert_eq!(c.on_packet(Packet::response(100, "part two")), Routed::Partial);
        assert!(rx.try_recv().is_err());

        assert_eq!(c.on_packet(Packet::response(101, "")), Routed::Completed);
        assert_eq!(rx.try_recv().unwrap(), Ok("part one, part two".to_string()));
        assert!(c.is_idle());
    }

    #[test]
    fn test_single_frame_mode_completes_on_first_frame() {
        let mut c = correlator(false);
        let (request, mut rx) = CommandRequest::new("say hi", Duration::from_secs(5));

        let packets = c.begin(request, Instant::now()).unwrap();
        assert_eq!(packets.len(), 1);

        assert_eq!(c.on_packet(Packet::response(100, "ok")), Routed::Completed);
        assert_eq!(rx.try_recv().unwrap(), Ok("ok".to_string()));
    }

    #[test]
    fn test_console_frames_bypass_commands() {
        let mut c = correlator(true);
        let (request, _rx) = CommandRequest::new("status", Duration::from_secs(5));
        c.begin(request, Instant::now()).unwrap();

        let routed = c.on_packet(Packet::response(0, "alice joined"));
        assert_eq!(routed, Routed::Console("alice joined".to_string()));
        assert_eq!(c.in_flight(), 1);
    }

    #[test]
    fn test_unmatched_frames_are_late() {
        let mut c = correlator(true);
        assert_eq!(c.on_packet(Packet::response(42, "stale")), Routed::Late { id: 42 });

        let (request, _rx) = CommandRequest::new("status", Duration::from_secs(5));
        c.begin(request, Instant::now()).unwrap();
        assert_eq!(c.on_packet(Packet::response(99, "older")), Routed::Late { id: 99 });
    }

    #[test]
    fn test_busy_returns_request() {
        let mut c = correlator(true);
        let (first, _rx1) = CommandRequest::new("a", Duration::from_secs(5));
        let (second, _rx2) = CommandRequest::new("b", Duration::from_secs(5));

        c.begin(first, Instant::now()).unwrap();
        let back = c.begin(second, Instant::now()).unwrap_err();
        assert_eq!(back.text, "b");
    }

    #[test]
    fn test_expire_times_out_caller_and_late_reply_is_dropped() {
        let mut c = correlator(true);
        let start = Instant::now();
        let (request, mut rx) = CommandRequest::new("slow", Duration::from_secs(2));
        c.begin(request, start).unwrap();

        assert!(c.expire(start + Duration::from_secs(1)).is_none());
        let expired = c.expire(start + Duration::from_secs(2)).unwrap();
        assert_eq!(expired, Expired { request_id: 100, probe: false });
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CommandError::TimedOut(Duration::from_secs(2)))
        );

        assert_eq!(c.on_packet(Packet::response(100, "finally")), Routed::Late { id: 100 });
    }

    #[test]
    fn test_probe_expiry_is_flagged() {
        let mut c = correlator(false);
        let start = Instant::now();
        c.begin(CommandRequest::probe("serverinfo", Duration::from_secs(1)), start)
            .unwrap();

        let expired = c.expire(start + Duration::from_secs(1)).unwrap();
        assert!(expired.probe);
    }

    #[test]
    fn test_request_expired_in_queue_is_not_sent() {
        let mut c = correlator(true);
        let (request, mut rx) = CommandRequest::new("queued", Duration::from_secs(2));
        let later = request.deadline + Duration::from_millis(1);

        let packets = c.begin(request, later).unwrap();
        assert!(packets.is_empty());
        assert!(c.is_idle());
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CommandError::TimedOut(Duration::from_secs(2)))
        );
    }

    #[test]
    fn test_in_flight_deadline_counts_queue_time() {
        let mut c = correlator(true);
        let (request, _rx) = CommandRequest::new("queued", Duration::from_secs(2));
        let issued = request.deadline;
        let later = issued - Duration::from_secs(1);

        c.begin(request, later).unwrap();
        assert_eq!(c.deadline(), Some(issued));
    }

    #[test]
    fn test_nul_in_command_rejected() {
        let mut c = correlator(true);
        let (request, mut rx) = CommandRequest::new("say \0oops", Duration::from_secs(5));

        let packets = c.begin(request, Instant::now()).unwrap();
        assert!(packets.is_empty());
        assert!(c.is_idle());
        assert!(matches!(rx.try_recv().unwrap(), Err(CommandError::InvalidCommand(_))));
    }

    #[test]
    fn test_ids_wrap_and_skip_zero() {
        let mut c = Correlator::new(ServerId::new("test"), i32::MAX, true);
        let (request, mut rx) = CommandRequest::new("a", Duration::from_secs(5));

        let packets = c.begin(request, Instant::now()).unwrap();
        assert_eq!(packets[0].id, i32::MAX);
        assert_eq!(packets[1].id, 1);

        c.on_packet(Packet::response(1, ""));
        assert!(rx.try_recv().is_ok());

        let (request, _rx) = CommandRequest::new("b", Duration::from_secs(5));
        let packets = c.begin(request, Instant::now()).unwrap();
        assert_eq!(packets[0].id, 2);
    }

    #[test]
    fn test_fail_resolves_in_flight() {
        let mut c = correlator(true);
        let (request, mut rx) = CommandRequest::new("status", Duration::from_secs(5));
        c.begin(request, Instant::now()).unwrap();

        c.fail(CommandError::ConnectionUnavailable(ServerId::new("test")));
        assert!(c.is_idle());
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CommandError::ConnectionUnavailable(ServerId::new("test")))
        );
    }
}
