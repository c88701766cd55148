//! Scripted node transport.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use shardkeeper::node::{NodeTarget, NodeTransport, Reply};
use shardkeeper::{Error, Result};

#[derive(Default)]
struct Script {
    /// Replies keyed by (pod, command); a `None` pod answers for every pod.
    replies: BTreeMap<(Option<String>, String), Reply>,
    failures: BTreeMap<(Option<String>, String), String>,
    calls: Vec<(String, String)>,
}

/// Answers direct calls from a script keyed by pod and command line.
/// Unscripted calls fail like an unknown command.
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<Script>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply `text` to `command` on `pod`.
    pub fn reply(&self, pod: &str, command: &str, text: &str) {
        self.reply_with(Some(pod), command, Reply::Bulk(text.to_string()));
    }

    /// Reply `text` to `command` on every pod without a specific script.
    pub fn reply_all(&self, command: &str, text: &str) {
        self.reply_with(None, command, Reply::Bulk(text.to_string()));
    }

    pub fn reply_with(&self, pod: Option<&str>, command: &str, reply: Reply) {
        let mut script = self.script.lock().unwrap();
        script
            .replies
            .insert((pod.map(str::to_string), command.to_string()), reply);
    }

    /// Fail `command` on `pod` with `reason`.
    pub fn fail(&self, pod: &str, command: &str, reason: &str) {
        let mut script = self.script.lock().unwrap();
        script.failures.insert(
            (Some(pod.to_string()), command.to_string()),
            reason.to_string(),
        );
    }

    /// Every call as `(pod, command line)`.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Calls whose command line starts with `prefix`.
    pub fn calls_to(&self, prefix: &str) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter(|(_, line)| line.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl NodeTransport for FakeTransport {
    async fn call(&self, target: &NodeTarget, argv: &[String]) -> Result<Reply> {
        let line = argv.join(" ");
        let mut script = self.script.lock().unwrap();
        script.calls.push((target.pod.clone(), line.clone()));

        let own = (Some(target.pod.clone()), line.clone());
        let any = (None, line.clone());
        if let Some(reason) = script.failures.get(&own) {
            return Err(Error::Command {
                command: line,
                reason: reason.clone(),
            });
        }
        if let Some(reply) = script.replies.get(&own).or_else(|| script.replies.get(&any)) {
            return Ok(reply.clone());
        }
        // Write commands acknowledge by default.
        if ["CLUSTER MEET", "CLUSTER FAILOVER", "CONFIG SET", "CLUSTER ADDSLOTSRANGE"]
            .iter()
            .any(|p| line.starts_with(p))
        {
            return Ok(Reply::Status("OK".to_string()));
        }
        Err(Error::Command {
            command: line,
            reason: "ERR unscripted command".to_string(),
        })
    }
}
