//! Allow-policy for inbound dag-sync pulls.

use libp2p_identity::PeerId;

/// Filters which peers may pull the advertisement DAG.
///
/// Either allow everyone except the listed peers, or deny everyone except
/// the listed peers. The default allows all.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    allow: bool,
    except: Vec<PeerId>,
}

impl SyncPolicy {
    pub fn allow_all_except(except: Vec<PeerId>) -> Self {
        Self {
            allow: true,
            except,
        }
    }

    pub fn deny_all_except(except: Vec<PeerId>) -> Self {
        Self {
            allow: false,
            except,
        }
    }

    pub fn allowed(&self, peer: &PeerId) -> bool {
        if self.except.contains(peer) {
            !self.allow
        } else {
            self.allow
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::allow_all_except(Vec::new())
    }
}
