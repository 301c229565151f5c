//! Serde adapters shared by the persisted models.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `Option<SystemTime>` stored as whole seconds since the UNIX epoch.
pub mod epoch_seconds {
    use super::*;

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(time) => {
                let since = time
                    .duration_since(UNIX_EPOCH)
                    .map_err(|_| serde::ser::Error::custom("timestamp before UNIX epoch"))?;
                serializer.serialize_some(&since.as_secs())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)))
    }
}
