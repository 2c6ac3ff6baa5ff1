//! Server notifications delivered to subscribed clients.
//!
//! Every structural change in the server (clients arriving and
//! leaving, ports appearing, connections changing, the graph
//! re-ordering, xruns) fans out as a [`Notification`] to every live
//! client that subscribed to that [`NotificationKind`]. Some kinds are
//! delivered synchronously (the engine waits for the client's reply),
//! the rest are fire-and-forget.

use crate::graph::PortId;

/// The subscription key for one callback kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// A client joined the server.
    AddClient,
    /// A client left the server.
    RemoveClient,
    /// This client was activated.
    Activate,
    /// A port was registered.
    PortRegistrationOn,
    /// A port was unregistered.
    PortRegistrationOff,
    /// Two ports were connected.
    PortConnect,
    /// Two ports were disconnected.
    PortDisconnect,
    /// A port changed its name.
    PortRename,
    /// The evaluation order changed.
    GraphOrder,
    /// The period length changed.
    BufferSize,
    /// The sample rate changed.
    SampleRate,
    /// Freewheel mode engaged.
    StartFreewheel,
    /// Freewheel mode released.
    StopFreewheel,
    /// At least one client missed the cycle deadline.
    XRun,
    /// The server is going away.
    ShutDown,
}

impl NotificationKind {
    /// Number of distinct kinds, for subscription masks.
    pub const COUNT: usize = 15;

    /// Stable index of this kind inside a [`CallbackMask`].
    pub fn index(self) -> usize {
        match self {
            Self::AddClient => 0,
            Self::RemoveClient => 1,
            Self::Activate => 2,
            Self::PortRegistrationOn => 3,
            Self::PortRegistrationOff => 4,
            Self::PortConnect => 5,
            Self::PortDisconnect => 6,
            Self::PortRename => 7,
            Self::GraphOrder => 8,
            Self::BufferSize => 9,
            Self::SampleRate => 10,
            Self::StartFreewheel => 11,
            Self::StopFreewheel => 12,
            Self::XRun => 13,
            Self::ShutDown => 14,
        }
    }

    /// True for kinds whose delivery blocks on the client's reply.
    pub fn is_sync(self) -> bool {
        matches!(
            self,
            Self::AddClient
                | Self::Activate
                | Self::BufferSize
                | Self::SampleRate
                | Self::StartFreewheel
                | Self::StopFreewheel
        )
    }
}

/// Which callback kinds a client wants delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackMask(u32);

impl CallbackMask {
    /// An empty subscription.
    pub fn none() -> Self {
        Self(0)
    }

    /// Every callback kind.
    pub fn all() -> Self {
        Self((1 << NotificationKind::COUNT) - 1)
    }

    /// Subscribes to `kind`.
    pub fn subscribe(&mut self, kind: NotificationKind) {
        self.0 |= 1 << kind.index();
    }

    /// Unsubscribes from `kind`.
    pub fn unsubscribe(&mut self, kind: NotificationKind) {
        self.0 &= !(1 << kind.index());
    }

    /// True if `kind` is subscribed.
    pub fn contains(&self, kind: NotificationKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }
}

/// A server event, fanned out to subscribed clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A client joined.
    AddClient {
        /// The new client's refnum.
        refnum: usize,
        /// The new client's name.
        name: String,
    },
    /// A client left.
    RemoveClient {
        /// The departed client's refnum.
        refnum: usize,
        /// The departed client's name.
        name: String,
    },
    /// Delivered to a client when its activation takes effect.
    Activate {
        /// The activated client.
        refnum: usize,
    },
    /// A port appeared.
    PortRegistered {
        /// The new port.
        port: PortId,
    },
    /// A port went away.
    PortUnregistered {
        /// The released port.
        port: PortId,
    },
    /// A connection was made.
    PortsConnected {
        /// Source output port.
        src: PortId,
        /// Destination input port.
        dst: PortId,
    },
    /// A connection was removed.
    PortsDisconnected {
        /// Source output port.
        src: PortId,
        /// Destination input port.
        dst: PortId,
    },
    /// A port was renamed.
    PortRenamed {
        /// The renamed port.
        port: PortId,
        /// Its previous name.
        old_name: String,
    },
    /// The evaluation order was republished.
    GraphReorder,
    /// The period length changed.
    BufferSize {
        /// New frames per period.
        frames: u32,
    },
    /// The sample rate changed.
    SampleRate {
        /// New rate in Hz.
        rate: u32,
    },
    /// Freewheel mode engaged.
    StartFreewheel,
    /// Freewheel mode released.
    StopFreewheel,
    /// A cycle ran long.
    XRun,
    /// The server is shutting down.
    ShutDown {
        /// Human-readable reason.
        reason: String,
    },
}

impl Notification {
    /// The subscription kind this notification is filtered by.
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::AddClient { .. } => NotificationKind::AddClient,
            Self::RemoveClient { .. } => NotificationKind::RemoveClient,
            Self::Activate { .. } => NotificationKind::Activate,
            Self::PortRegistered { .. } => NotificationKind::PortRegistrationOn,
            Self::PortUnregistered { .. } => NotificationKind::PortRegistrationOff,
            Self::PortsConnected { .. } => NotificationKind::PortConnect,
            Self::PortsDisconnected { .. } => NotificationKind::PortDisconnect,
            Self::PortRenamed { .. } => NotificationKind::PortRename,
            Self::GraphReorder => NotificationKind::GraphOrder,
            Self::BufferSize { .. } => NotificationKind::BufferSize,
            Self::SampleRate { .. } => NotificationKind::SampleRate,
            Self::StartFreewheel => NotificationKind::StartFreewheel,
            Self::StopFreewheel => NotificationKind::StopFreewheel,
            Self::XRun => NotificationKind::XRun,
            Self::ShutDown { .. } => NotificationKind::ShutDown,
        }
    }
}
