//! Miscellaneous utilities.

use std::{
    fmt, fs,
    io::{self, Write},
    time::Duration,
};

use camino::Utf8Path;
use serde::{
    de::{self, Visitor},
    Deserializer, Serializer,
};
use tokio::task::JoinHandle;

/// Atomically write a file.
///
/// Used by the journal writer's `.xfrd.tmp` → `.xfrd` rotation and by the
/// `xfrd-state` backup file.
///
/// # Panics
///
/// Panics if `path` does not have a containing directory.
pub fn write_file(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .expect("'path' must be a file, so it must have a parent");
    fs::create_dir_all(dir)?;

    let mut tmp_file = tempfile::Builder::new().tempfile_in(dir)?;
    tmp_file.as_file_mut().write_all(contents)?;
    let _ = tmp_file.persist(path)?;

    Ok(())
}

/// Update a value, recording whether it actually changed.
#[inline]
pub fn update_value<T: Eq>(dst: &mut T, value: T, changed: &mut bool) {
    if *dst != value {
        *changed = true;
        *dst = value;
    }
}

/// A [`JoinHandle`] that aborts its task when dropped.
///
/// Every per-zone refresh attempt, TCP read/write pump, and NOTIFY retry
/// timer is spawned as its own task; the handle lives inside the state
/// that owns that attempt (a [`crate::xfrd::zone::ZoneState`] or the
/// [`crate::notify::NotifySender`]'s per-peer campaign). Wrapping the handle this way means
/// replacing or dropping the owning state cancels the in-flight task
/// without an explicit shutdown message, mirroring the reactor's
/// "no handler is ever invoked after its removal returns" guarantee for
/// tasks instead of callbacks.
#[derive(Debug)]
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> From<JoinHandle<T>> for AbortOnDrop<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> std::ops::Deref for AbortOnDrop<T> {
    type Target = JoinHandle<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> std::ops::DerefMut for AbortOnDrop<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub fn serialize_duration_as_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

pub fn deserialize_duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct U64Visitor;
    impl<'de> Visitor<'de> for U64Visitor {
        type Value = u64;
        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a u64 unsigned integer value")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }
    }
    Ok(Duration::from_secs(
        deserializer.deserialize_u64(U64Visitor)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_on_drop_cancels_the_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = rx.await;
        });
        let guard = AbortOnDrop::from(handle);
        drop(guard);
        // The task was aborted before it could receive anything; sending
        // now must fail because the receiver is gone.
        assert!(tx.send(()).is_err());
    }

    #[test]
    fn update_value_reports_change() {
        let mut changed = false;
        let mut x = 1;
        update_value(&mut x, 1, &mut changed);
        assert!(!changed);
        update_value(&mut x, 2, &mut changed);
        assert!(changed);
    }
}
