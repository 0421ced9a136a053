//! Free-name search for batch resources created during setup.

use std::collections::HashSet;

use super::PipelineError;

/// Suffixes `_2` through `_99` are tried after the base name.
pub const MAX_SUFFIX: u32 = 99;

/// Return `base_name` if unused, otherwise the first `base_name_N` that is.
pub fn find_free_name<I, S>(base_name: &str, existing: I) -> Result<String, PipelineError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    find_free_name_for("resource", base_name, existing)
}

/// As [`find_free_name`], naming the resource kind in logs and errors.
pub fn find_free_name_for<I, S>(resource: &str, base_name: &str, existing: I) -> Result<String, PipelineError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let taken: HashSet<String> = existing.into_iter().map(|s| s.as_ref().to_string()).collect();

    if !taken.contains(base_name) {
        return Ok(base_name.to_string());
    }
    tracing::info!(%resource, name = %base_name, "name already exists");

    for suffix in 2..=MAX_SUFFIX {
        let candidate = format!("{}_{}", base_name, suffix);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        tracing::debug!(%resource, name = %candidate, "name already exists");
    }

    tracing::error!(%resource, %base_name, existing = taken.len(), "no free name left");
    Err(PipelineError::Exhausted {
        resource: resource.to_string(),
        base_name: base_name.to_string(),
        attempts: MAX_SUFFIX - 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unused_base_name_is_kept() {
        assert_eq!(find_free_name("queue", Vec::<String>::new()).unwrap(), "queue");
        assert_eq!(find_free_name("queue", ["other"]).unwrap(), "queue");
    }

    #[test]
    fn test_first_collision_gets_suffix_two() {
        assert_eq!(find_free_name("queue", ["queue"]).unwrap(), "queue_2");
    }

    #[test]
    fn test_skips_taken_suffixes() {
        assert_eq!(
            find_free_name("queue", ["queue", "queue_2", "queue_3"]).unwrap(),
            "queue_4"
        );
    }

    #[test]
    fn test_gap_in_suffixes_is_reused() {
        assert_eq!(find_free_name("queue", ["queue", "queue_3"]).unwrap(), "queue_2");
    }

    #[test]
    fn test_exhaustion_after_ninety_eight_suffixes() {
        let mut taken = vec!["env".to_string()];
        taken.extend((2..=MAX_SUFFIX).map(|i| format!("env_{}", i)));

        match find_free_name_for("compute environment", "env", &taken) {
            Err(PipelineError::Exhausted { attempts, resource, .. }) => {
                assert_eq!(attempts, 98);
                assert_eq!(resource, "compute environment");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }

        // One more free slot at the top is still found.
        taken.pop();
        assert_eq!(find_free_name("env", &taken).unwrap(), "env_99");
    }
}
