//! The actor table read by the checker.

use std::ffi::CString;

use stepwise_protocol::layout::{ActorRecord, ActorTable, SimcallRecord};

use crate::published::stepwise_actors;

/// Live and terminated actors, with the simcall each one is blocked on.
///
/// Once [`publish`](Self::publish)ed, every change that may move the
/// records updates `stepwise_actors`.
#[derive(Debug, Default)]
pub struct Actors {
    live: Vec<ActorRecord>,
    dead: Vec<ActorRecord>,
    /// Backing storage of the name and host pointers.
    strings: Vec<CString>,
    published: bool,
}

impl Actors {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let string = CString::new(text.replace('\0', "")).unwrap_or_default();
        let address = string.as_ptr() as u64;
        self.strings.push(string);
        address
    }

    /// Add a live actor; its simcall starts as `None`.
    pub fn spawn(&mut self, pid: u64, name: &str, host: &str) {
        let name = self.intern(name);
        let host = self.intern(host);
        self.live.push(ActorRecord {
            pid,
            name,
            host,
            simcall: SimcallRecord {
                issuer: pid,
                ..Default::default()
            },
        });
        self.refresh();
    }

    /// Move `pid` to the dead list.
    pub fn exit(&mut self, pid: u64) -> bool {
        let Some(index) = self.live.iter().position(|a| a.pid == pid) else {
            return false;
        };
        let mut record = self.live.remove(index);
        record.simcall = SimcallRecord {
            issuer: pid,
            result: record.simcall.result,
            ..Default::default()
        };
        self.dead.push(record);
        self.refresh();
        true
    }

    pub fn simcall(&self, pid: u64) -> Option<&SimcallRecord> {
        self.live.iter().find(|a| a.pid == pid).map(|a| &a.simcall)
    }

    pub fn simcall_mut(&mut self, pid: u64) -> Option<&mut SimcallRecord> {
        self.live
            .iter_mut()
            .find(|a| a.pid == pid)
            .map(|a| &mut a.simcall)
    }

    /// Record the simcall `pid` is about to block on.  The result of the
    /// previous one is kept.
    pub fn set_simcall(&mut self, pid: u64, simcall: SimcallRecord) -> bool {
        match self.simcall_mut(pid) {
            Some(slot) => {
                *slot = SimcallRecord {
                    issuer: pid,
                    result: slot.result,
                    ..simcall
                };
                true
            }
            None => false,
        }
    }

    /// Publish the outcome of the simcall `pid` just executed.
    pub fn set_result(&mut self, pid: u64, result: u64) -> bool {
        match self.simcall_mut(pid) {
            Some(slot) => {
                slot.result = result;
                true
            }
            None => false,
        }
    }

    pub fn live(&self) -> &[ActorRecord] {
        &self.live
    }

    pub fn dead(&self) -> &[ActorRecord] {
        &self.dead
    }

    pub fn table(&self) -> ActorTable {
        ActorTable {
            actors: self.live.as_ptr() as u64,
            actor_count: self.live.len() as u64,
            dead_actors: self.dead.as_ptr() as u64,
            dead_actor_count: self.dead.len() as u64,
        }
    }

    /// Make this table the one the checker reads.
    pub fn publish(&mut self) {
        self.published = true;
        self.refresh();
    }

    fn refresh(&self) {
        if self.published {
            stepwise_actors.set(self.table());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_protocol::layout::SimcallCall;
    use std::ffi::CStr;

    #[test]
    fn records_carry_names_and_simcalls() {
        let mut actors = Actors::new();
        actors.spawn(1, "client", "host-a");
        actors.spawn(2, "", "host-b");
        assert!(actors.set_simcall(
            2,
            SimcallRecord {
                call: SimcallCall::CommIrecv as u32,
                mailbox: 0x40,
                ..Default::default()
            }
        ));
        assert!(!actors.set_simcall(9, SimcallRecord::default()));

        let first = actors.live()[0];
        let name = unsafe { CStr::from_ptr(first.name as *const libc::c_char) };
        assert_eq!(name.to_str().unwrap(), "client");
        assert_eq!(actors.live()[1].name, 0);

        let simcall = actors.simcall(2).unwrap();
        assert_eq!(simcall.issuer, 2);
        assert_eq!(simcall.mailbox, 0x40);
    }

    #[test]
    fn exited_actors_move_to_the_dead_list() {
        let mut actors = Actors::new();
        actors.spawn(1, "a", "h");
        actors.spawn(2, "b", "h");
        assert!(actors.exit(1));
        assert!(!actors.exit(1));

        let table = actors.table();
        assert_eq!(table.actor_count, 1);
        assert_eq!(table.dead_actor_count, 1);
        let live = unsafe { *(table.actors as *const ActorRecord) };
        assert_eq!(live.pid, 2);
        assert_eq!(actors.dead()[0].simcall.call, SimcallCall::None as u32);
    }

    #[test]
    fn results_survive_the_next_simcall() {
        let mut actors = Actors::new();
        actors.spawn(1, "a", "h");
        assert!(actors.set_result(1, 0xc0));
        actors.set_simcall(
            1,
            SimcallRecord {
                call: SimcallCall::CommWait as u32,
                result: 5,
                ..Default::default()
            },
        );
        assert_eq!(actors.simcall(1).unwrap().result, 0xc0);
        actors.exit(1);
        assert_eq!(actors.dead()[0].simcall.result, 0xc0);
        assert!(!actors.set_result(1, 0));
    }
}
