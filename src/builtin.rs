//! Task and condition implementations available to workflows run from the
//! command line.
//!
//! | key        | kind      | behaviour                                            |
//! |------------|-----------|------------------------------------------------------|
//! | `echo`     | task      | copies `Input` to `Output`                           |
//! | `sleep`    | task      | waits `SleepMs` milliseconds (default 100)           |
//! | `fail`     | task      | fails with `FailMessage`                             |
//! | `always`   | condition | true                                                 |
//! | `never`    | condition | false                                                |
//! | `has-key`  | condition | true when every `RequiredKey` value is a present key |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use weft_metadata::Metadata;
use weft_processor::{ExecutionTypeRegistry, InstanceError, TaskInstance};

const DEFAULT_SLEEP_MS: u64 = 100;

pub struct Echo;

#[async_trait]
impl TaskInstance for Echo {
  async fn run(&self, metadata: &Metadata) -> Result<Metadata, InstanceError> {
    let mut out = Metadata::new();
    out.add_all("Output", metadata.get_all("Input").iter().cloned());
    Ok(out)
  }
}

pub struct Sleep;

#[async_trait]
impl TaskInstance for Sleep {
  async fn run(&self, metadata: &Metadata) -> Result<Metadata, InstanceError> {
    let ms = match metadata.get("SleepMs") {
      Some(raw) => raw
        .parse::<u64>()
        .map_err(|e| InstanceError::new(format!("invalid SleepMs '{raw}': {e}")))?,
      None => DEFAULT_SLEEP_MS,
    };
    tokio::time::sleep(Duration::from_millis(ms)).await;

    let mut out = Metadata::new();
    out.add("SleptMs", ms.to_string());
    Ok(out)
  }
}

pub struct Fail;

#[async_trait]
impl TaskInstance for Fail {
  async fn run(&self, metadata: &Metadata) -> Result<Metadata, InstanceError> {
    Err(InstanceError::new(metadata.get("FailMessage").unwrap_or("task failed")))
  }
}

fn has_required_keys(metadata: &Metadata) -> Result<bool, InstanceError> {
  let required = metadata.get_all("RequiredKey");
  if required.is_empty() {
    return Err(InstanceError::new("has-key needs at least one RequiredKey"));
  }
  Ok(required.iter().all(|key| metadata.contains_key(key)))
}

/// Registry with every built-in task and condition.
pub fn registry() -> ExecutionTypeRegistry {
  let mut registry = ExecutionTypeRegistry::new();
  registry.register_task_instance("echo", Arc::new(Echo));
  registry.register_task_instance("sleep", Arc::new(Sleep));
  registry.register_task_instance("fail", Arc::new(Fail));
  registry.register_condition_instance(
    "always",
    Arc::new(|_: &Metadata| Ok::<_, InstanceError>(true)),
  );
  registry.register_condition_instance(
    "never",
    Arc::new(|_: &Metadata| Ok::<_, InstanceError>(false)),
  );
  registry.register_condition_instance("has-key", Arc::new(has_required_keys));
  registry
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_processor::ConditionInstance;

  fn metadata(pairs: &[(&str, &str)]) -> Metadata {
    pairs.iter().copied().collect()
  }

  #[tokio::test]
  async fn test_echo_copies_every_input_value() {
    let out = Echo
      .run(&metadata(&[("Input", "a"), ("Input", "b")]))
      .await
      .unwrap();
    assert_eq!(out.get_all("Output"), ["a", "b"]);
  }

  #[tokio::test]
  async fn test_sleep_rejects_bad_duration() {
    let err = Sleep
      .run(&metadata(&[("SleepMs", "soon")]))
      .await
      .unwrap_err();
    assert!(err.message.contains("invalid SleepMs"));
  }

  #[tokio::test]
  async fn test_sleep_reports_duration() {
    let out = Sleep.run(&metadata(&[("SleepMs", "1")])).await.unwrap();
    assert_eq!(out.get("SleptMs"), Some("1"));
  }

  #[tokio::test]
  async fn test_fail_uses_message() {
    let err = Fail
      .run(&metadata(&[("FailMessage", "disk full")]))
      .await
      .unwrap_err();
    assert_eq!(err.message, "disk full");
  }

  #[test]
  fn test_has_key() {
    let registry = registry();
    let condition = registry.condition("has-key").unwrap();

    let present = metadata(&[("RequiredKey", "Input"), ("Input", "x")]);
    assert!(condition.evaluate(&present).unwrap());

    let missing = metadata(&[
      ("RequiredKey", "Input"),
      ("RequiredKey", "Other"),
      ("Input", "x"),
    ]);
    assert!(!condition.evaluate(&missing).unwrap());

    assert!(condition.evaluate(&Metadata::new()).is_err());
  }

  #[test]
  fn test_registry_contents() {
    let registry = registry();
    for key in ["echo", "sleep", "fail"] {
      assert!(registry.has_task(key), "{key}");
    }
    for key in ["always", "never", "has-key"] {
      assert!(registry.has_condition(key), "{key}");
    }
  }
}
