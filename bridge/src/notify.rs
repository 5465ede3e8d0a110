//! Outbound notices for the chat platform.
//!
//! Subsystems report outcomes here and move on; delivery is fire-and-forget
//! and never feeds back into subsystem state. Notices carry structured
//! data only, rendering them is up to the chat layer.

use log::{info, warn};
use protocol::ServerId;
use tokio::sync::mpsc;

use crate::model::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Kits,
    Zones,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    KitDenied { player: String, kit: String },
    KitDuplicate { player: String, kit: String },
    KitOnCooldown { player: String, kit: String, until: u64 },
    KitDelivered { player: String, kit: String },
    KitFailed { player: String, kit: String, attempts: u32, reason: String },
    ZoneExpired { owner: String },
    AuthRejected,
}

impl Notice {
    pub fn channel(&self) -> Channel {
        match self {
            Notice::KitDenied { .. }
            | Notice::KitDuplicate { .. }
            | Notice::KitOnCooldown { .. }
            | Notice::KitDelivered { .. }
            | Notice::KitFailed { .. } => Channel::Kits,
            Notice::ZoneExpired { .. } => Channel::Zones,
            Notice::AuthRejected => Channel::Admin,
        }
    }

    /// Notices an operator must see.
    pub fn is_critical(&self) -> bool {
        matches!(self, Notice::AuthRejected | Notice::KitFailed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub tenant: TenantId,
    pub server: ServerId,
    pub channel: Channel,
    pub notice: Notice,
}

impl Notification {
    pub fn new(tenant: TenantId, server: ServerId, notice: Notice) -> Self {
        Self {
            tenant,
            server,
            channel: notice.channel(),
            notice,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notices to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        if n.notice.is_critical() {
            warn!("[{}/{}] {:?}: {:?}", n.tenant, n.server, n.channel, n.notice);
        } else {
            info!("[{}/{}] {:?}: {:?}", n.tenant, n.server, n.channel, n.notice);
        }
    }
}

/// Hands notices to whatever drains the receiving end.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("Notification dropped, no receiver");
        }
    }
}
