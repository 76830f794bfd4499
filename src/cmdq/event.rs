//! Named hardware semaphores
//!
//! Semaphore ids are platform-specific; each display resolves the names it
//! needs once at bring-up. A name that does not resolve disables the feature
//! depending on it instead of failing bring-up.

use std::collections::HashMap;
use std::fmt;

/// Hardware semaphore id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u16);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev{}", self.0)
    }
}

/// Semaphores used by the commit protocol and the hardware loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Previous frame done
    StreamEof,
    StreamDirty,
    /// Configuration token shared by commits and the trigger loop
    StreamBlock,
    /// Command-driven frame complete
    CmdEof,
    /// Timing-generator end of frame
    ContinuousEof,
    PanelTe,
    /// Early timing edge, ahead of the panel edge by the prefetch offset
    PrefetchTe,
    WdmaEof,
}

impl EventName {
    pub const ALL: [EventName; 8] = [
        Self::StreamEof,
        Self::StreamDirty,
        Self::StreamBlock,
        Self::CmdEof,
        Self::ContinuousEof,
        Self::PanelTe,
        Self::PrefetchTe,
        Self::WdmaEof,
    ];

    /// Name as written in the platform description
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamEof => "stream-eof",
            Self::StreamDirty => "stream-dirty",
            Self::StreamBlock => "stream-block",
            Self::CmdEof => "cmd-eof",
            Self::ContinuousEof => "continuous-eof",
            Self::PanelTe => "panel-te",
            Self::PrefetchTe => "prefetch-te",
            Self::WdmaEof => "wdma-eof",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|ev| ev.as_str() == name)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved semaphore ids of one display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTable {
    ids: HashMap<EventName, EventId>,
}

impl EventTable {
    /// Resolve names from a platform `name = id` table. Unknown names are
    /// logged and ignored.
    pub fn resolve<'a, I>(display: usize, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a u16)>,
    {
        let mut ids = HashMap::new();
        for (name, id) in entries {
            match EventName::from_name(name) {
                Some(ev) => {
                    ids.insert(ev, EventId(*id));
                }
                None => log::warn!("[disp{}] unknown semaphore name '{}'", display, name),
            }
        }
        let table = Self { ids };
        for ev in EventName::ALL {
            if table.get(ev).is_none() {
                log::warn!("[disp{}] semaphore '{}' unresolved", display, ev);
            }
        }
        table
    }

    pub fn insert(&mut self, name: EventName, id: EventId) {
        self.ids.insert(name, id);
    }

    pub fn get(&self, name: EventName) -> Option<EventId> {
        self.ids.get(&name).copied()
    }

    /// All three semaphores the trigger loop cannot run without
    pub fn has_trigger_set(&self) -> bool {
        [EventName::StreamDirty, EventName::StreamEof, EventName::CmdEof]
            .iter()
            .all(|ev| self.get(*ev).is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventName, EventId)> + '_ {
        self.ids.iter().map(|(name, id)| (*name, *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_names() {
        let raw: HashMap<String, u16> = [
            ("stream-eof".to_string(), 10),
            ("stream-dirty".to_string(), 11),
            ("cmd-eof".to_string(), 13),
            ("bogus".to_string(), 99),
        ]
        .into_iter()
        .collect();
        let table = EventTable::resolve(0, raw.iter());
        assert_eq!(table.get(EventName::StreamEof), Some(EventId(10)));
        assert_eq!(table.get(EventName::PanelTe), None);
        assert!(table.has_trigger_set());
        assert_eq!(table.iter().count(), 3);
    }

    #[test]
    fn test_missing_trigger_set() {
        let mut table = EventTable::default();
        table.insert(EventName::StreamEof, EventId(1));
        assert!(!table.has_trigger_set());
    }

    #[test]
    fn test_name_round_trip() {
        for ev in EventName::ALL {
            assert_eq!(EventName::from_name(ev.as_str()), Some(ev));
        }
    }
}
