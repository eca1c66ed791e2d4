//! Change notifications for named maps.

/// Kind of change applied to a map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEventKind {
    /// The key had no value before.
    Inserted,
    /// An existing value was replaced.
    Updated,
    /// The value was removed.
    Deleted,
}

/// A committed change to one entry of a [`NamedMap`](super::NamedMap).
#[derive(Debug, Clone)]
pub struct MapEvent<V> {
    /// Name of the map the entry belongs to.
    pub map: String,
    /// The entry key.
    pub key: String,
    /// What happened to the entry.
    pub kind: MapEventKind,
    /// Value before the change.
    pub old_value: Option<V>,
    /// Value after the change.
    pub new_value: Option<V>,
}

impl<V> MapEvent<V> {
    pub(crate) fn new(map: &str, key: &str, old_value: Option<V>, new_value: Option<V>) -> Self {
        let kind = match (&old_value, &new_value) {
            (None, _) => MapEventKind::Inserted,
            (Some(_), Some(_)) => MapEventKind::Updated,
            (Some(_), None) => MapEventKind::Deleted,
        };
        Self {
            map: map.to_string(),
            key: key.to_string(),
            kind,
            old_value,
            new_value,
        }
    }
}

/// Listener for map entry changes.
///
/// Called on the thread that committed the change, after the entry's lock
/// has been released. Implementations must not block.
pub trait MapListener<V>: Send + Sync + 'static {
    /// Called once per committed change.
    fn on_event(&self, event: &MapEvent<V>);
}

impl<V, F> MapListener<V> for F
where
    F: Fn(&MapEvent<V>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &MapEvent<V>) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        assert_eq!(
            MapEvent::new("m", "k", None, Some(1)).kind,
            MapEventKind::Inserted
        );
        assert_eq!(
            MapEvent::new("m", "k", Some(1), Some(2)).kind,
            MapEventKind::Updated
        );
        assert_eq!(
            MapEvent::<i32>::new("m", "k", Some(1), None).kind,
            MapEventKind::Deleted
        );
    }
}
