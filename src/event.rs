use std::fmt;

/// LifecycleEvent identifies the kind of raw VM lifecycle event recorded in
/// the warehouse event table. Values match the event_type dimension loaded
/// by the collection jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleEvent {
    RequestStart = 1,
    Start = 2,
    RequestStop = 3,
    Stop = 4,
    RequestTerminate = 5,
    Terminate = 6,
    RequestResume = 7,
    Resume = 8,
    StateReport = 16,
    Suspend = 17,
    Shelve = 19,
    Unshelve = 20,
    StartError = 41,
    PowerOffStart = 44,
    PowerOff = 45,
    PauseStart = 54,
    Pause = 55,
    UnpauseStart = 56,
    UnpauseEnd = 57,
    PowerOnStart = 58,
    PowerOn = 59,
    UnsuspendStart = 60,
    Unsuspend = 61,
    SuspendStart = 62,
    UnshelveEnd = 63,
    ShelveStart = 64,
}

/// Semantic category of a lifecycle event, as seen by the VM interval
/// reconstruction machine. Categories are fixed lookup tables, not computed:
/// classification is a pure function of the event code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Periodic liveness signal; extends the open interval without closing it.
    Heartbeat,
    /// Can never open a new interval.
    Terminal,
    /// Closes the open interval (and usually reopens from the same row).
    StateChanging,
    /// No effect on interval boundaries.
    Other,
}

impl LifecycleEvent {
    /// Returns the canonical log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RequestStart => "request_start",
            Self::Start => "start",
            Self::RequestStop => "request_stop",
            Self::Stop => "stop",
            Self::RequestTerminate => "request_terminate",
            Self::Terminate => "terminate",
            Self::RequestResume => "request_resume",
            Self::Resume => "resume",
            Self::StateReport => "state_report",
            Self::Suspend => "suspend",
            Self::Shelve => "shelve",
            Self::Unshelve => "unshelve",
            Self::StartError => "start_error",
            Self::PowerOffStart => "power_off_start",
            Self::PowerOff => "power_off",
            Self::PauseStart => "pause_start",
            Self::Pause => "pause",
            Self::UnpauseStart => "unpause_start",
            Self::UnpauseEnd => "unpause_end",
            Self::PowerOnStart => "power_on_start",
            Self::PowerOn => "power_on",
            Self::UnsuspendStart => "unsuspend_start",
            Self::Unsuspend => "unsuspend",
            Self::SuspendStart => "suspend_start",
            Self::UnshelveEnd => "unshelve_end",
            Self::ShelveStart => "shelve_start",
        }
    }

    /// Convert from the raw event_type code. Unknown codes (filtered out by
    /// the source query in normal operation) return None and are inert.
    pub fn from_code(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::RequestStart),
            2 => Some(Self::Start),
            3 => Some(Self::RequestStop),
            4 => Some(Self::Stop),
            5 => Some(Self::RequestTerminate),
            6 => Some(Self::Terminate),
            7 => Some(Self::RequestResume),
            8 => Some(Self::Resume),
            16 => Some(Self::StateReport),
            17 => Some(Self::Suspend),
            19 => Some(Self::Shelve),
            20 => Some(Self::Unshelve),
            41 => Some(Self::StartError),
            44 => Some(Self::PowerOffStart),
            45 => Some(Self::PowerOff),
            54 => Some(Self::PauseStart),
            55 => Some(Self::Pause),
            56 => Some(Self::UnpauseStart),
            57 => Some(Self::UnpauseEnd),
            58 => Some(Self::PowerOnStart),
            59 => Some(Self::PowerOn),
            60 => Some(Self::UnsuspendStart),
            61 => Some(Self::Unsuspend),
            62 => Some(Self::SuspendStart),
            63 => Some(Self::UnshelveEnd),
            64 => Some(Self::ShelveStart),
            _ => None,
        }
    }

    /// Return all known lifecycle events in code order.
    pub fn all() -> &'static [Self] {
        &[
            Self::RequestStart,
            Self::Start,
            Self::RequestStop,
            Self::Stop,
            Self::RequestTerminate,
            Self::Terminate,
            Self::RequestResume,
            Self::Resume,
            Self::StateReport,
            Self::Suspend,
            Self::Shelve,
            Self::Unshelve,
            Self::StartError,
            Self::PowerOffStart,
            Self::PowerOff,
            Self::PauseStart,
            Self::Pause,
            Self::UnpauseStart,
            Self::UnpauseEnd,
            Self::PowerOnStart,
            Self::PowerOn,
            Self::UnsuspendStart,
            Self::Unsuspend,
            Self::SuspendStart,
            Self::UnshelveEnd,
            Self::ShelveStart,
        ]
    }

    /// True for the periodic liveness signals.
    pub const fn is_heartbeat(self) -> bool {
        matches!(self, Self::RequestStart | Self::StateReport)
    }

    /// True for events that may never open a new interval.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminate | Self::StartError)
    }

    /// True for events allowed to open a new interval when none is open.
    /// Everything except the terminal events qualifies: a stop-like event
    /// opens an interval too, recording the span during which the instance
    /// sat in that stopped state.
    pub const fn opens_interval(self) -> bool {
        !self.is_terminal()
    }

    /// True for events that close the currently open interval. State
    /// reports only extend it, and a start error has no boundary effect.
    pub const fn closes_interval(self) -> bool {
        !matches!(self, Self::StateReport | Self::StartError)
    }

    /// True for events that leave the instance not running. An interval
    /// opened by one of these is an inactive span; a heartbeat arriving on
    /// top of it means the instance restarted without a captured start
    /// event.
    pub const fn implies_inactive(self) -> bool {
        matches!(
            self,
            Self::Stop
                | Self::Terminate
                | Self::Suspend
                | Self::Shelve
                | Self::PowerOffStart
                | Self::PowerOff
                | Self::Pause
        )
    }

    /// Primary category, by precedence: heartbeat, terminal, state-changing.
    pub const fn category(self) -> EventCategory {
        if self.is_heartbeat() {
            EventCategory::Heartbeat
        } else if self.is_terminal() {
            EventCategory::Terminal
        } else if self.closes_interval() {
            EventCategory::StateChanging
        } else {
            EventCategory::Other
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
