//! The acceptor half of single-decree Paxos.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::log::PaxosLog;
use super::protocol::{AcceptArg, DecideArg, PrepareArg, PrepareRes, Proposal};

/// Upcall fired once an instance is newly decided, letting the view
/// manager (or any other consumer) react to the agreed value.
pub type CommitHook = Arc<dyn Fn(u32, Vec<u8>) + Send + Sync>;

pub struct Acceptor {
    me: String,
    log: Mutex<PaxosLog>,
    on_commit: Mutex<Option<CommitHook>>,
}

impl Acceptor {
    /// Creates an acceptor for `me`. If `first` is set and no value has
    /// ever been decided, instance 1 is seeded with `initial_value`
    /// directly — the bootstrap case where a single node forms the very
    /// first view before anyone else has joined.
    pub fn new(me: &str, first: bool, initial_value: Vec<u8>) -> Arc<Self> {
        let mut log = PaxosLog::new(me);
        if first && log.instance_h == 0 {
            log.log_instance(1, initial_value, me);
        }
        Arc::new(Self { me: me.to_string(), log: Mutex::new(log), on_commit: Mutex::new(None) })
    }

    pub async fn set_commit_hook(&self, hook: CommitHook) {
        *self.on_commit.lock().await = Some(hook);
    }

    pub async fn instance(&self) -> u32 {
        self.log.lock().await.instance_h
    }

    pub async fn value(&self, instance: u32) -> Option<Vec<u8>> {
        self.log.lock().await.value(instance).cloned()
    }

    pub async fn n_h(&self) -> Proposal {
        self.log.lock().await.n_h.clone()
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.log.lock().await.snapshot()
    }

    pub async fn restore(&self, bytes: &[u8]) -> crate::codec::Result<()> {
        *self.log.lock().await = PaxosLog::restore(bytes)?;
        Ok(())
    }

    /// Commits `v` for `instance` directly, bypassing a Paxos round —
    /// used when the proposer on this node already knows the outcome
    /// (it drove the round itself) or the caller is forming the very
    /// first view.
    pub async fn commit(&self, instance: u32, v: Vec<u8>) {
        let hook = {
            let mut log = self.log.lock().await;
            if instance <= log.instance_h {
                return;
            }
            assert!(
                instance == log.instance_h + 1,
                "commit for instance {instance} skips ahead of decided instance {} without an intervening decision",
                log.instance_h
            );
            log.log_instance(instance, v.clone(), &self.me);
            self.on_commit.lock().await.clone()
        };
        if let Some(hook) = hook {
            hook(instance, v);
        }
    }

    pub(super) async fn prepare_handler(&self, arg: PrepareArg) -> PrepareRes {
        let mut log = self.log.lock().await;
        if arg.instance <= log.instance_h {
            let v_a = log.value(arg.instance).cloned().unwrap_or_default();
            return PrepareRes { oldinstance: true, accept: false, n_a: Proposal::zero(&self.me), v_a };
        }
        if arg.n > log.n_h {
            log.log_promise(arg.n);
            PrepareRes { oldinstance: false, accept: true, n_a: log.n_a.clone(), v_a: log.v_a.clone() }
        } else {
            PrepareRes { oldinstance: false, accept: false, n_a: Proposal::zero(&self.me), v_a: Vec::new() }
        }
    }

    pub(super) async fn accept_handler(&self, arg: AcceptArg) -> bool {
        let mut log = self.log.lock().await;
        if arg.instance <= log.instance_h {
            return false;
        }
        if arg.n >= log.n_h {
            log.log_accept(arg.n, arg.v);
            true
        } else {
            false
        }
    }

    pub(super) async fn decide_handler(&self, arg: DecideArg) {
        self.commit(arg.instance, arg.v).await;
    }
}
