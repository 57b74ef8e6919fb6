use log::debug;

use crate::error::{OrchestratorError, Result};

/// The maximum amount of files this process may open, if the platform tells.
pub fn open_file_limit() -> Option<u64> {
    #[cfg(unix)]
    {
        // SAFETY: sysconf only reads a system limit.
        let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        u64::try_from(limit).ok()
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// Refuses to start a task if the open file limit is not above `required`.
pub fn check_open_files(required: u64) -> Result<()> {
    let Some(limit) = open_file_limit() else {
        debug!("open file limit unknown, skipping check");
        return Ok(());
    };

    if limit <= required {
        return Err(OrchestratorError::ResourceExhaustion { limit, required });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_requirement_always_passes() {
        assert!(check_open_files(0).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_impossible_requirement_is_refused() {
        assert!(matches!(
            check_open_files(u64::MAX),
            Err(OrchestratorError::ResourceExhaustion { .. })
        ));
    }
}
