use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Execution(pub Vec<Command>);

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
#[derive(Clone, Debug)]
pub enum Command {
    /// Start `count` nodes on the local network
    Start {
        count: usize,
    },

    /// Create `service` on `group` through the reconfigurator on `via`
    Create {
        via: usize,
        service: String,
        group: Vec<usize>,
    },

    /// Write through the given node
    Put {
        id: usize,
        service: String,
        key: String,
        value: String,
    },

    /// Read through the given node, optionally checking the value
    Get {
        id: usize,
        service: String,
        key: String,
        #[serde(default)]
        expect: Option<String>,
    },

    /// Crash the given node
    Crash {
        id: usize,
    },

    /// Bring a crashed node back from its store
    Restart {
        id: usize,
    },

    /// Drop all packets between two nodes, both ways
    Cut {
        a: usize,
        b: usize,
    },

    /// Restore every cut link
    Heal,

    /// Move `service` to `group` through the reconfigurator on `via`
    Reconfigure {
        via: usize,
        service: String,
        group: Vec<usize>,
    },

    /// Delete `service` through the reconfigurator on `via`
    Delete {
        via: usize,
        service: String,
    },

    /// Sleep the test harness for `ms` milliseconds
    Sleep {
        ms: u64,
    },

    /// Check that every live node hosting `service` holds the same table
    Check {
        service: String,
    },
}
