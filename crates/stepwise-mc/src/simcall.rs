//! Pending simcalls of the checked actors, decoded from their remote records.

use stepwise_protocol::layout::{
    CommRecord, SimcallCall, SimcallRecord, COMM_DONE, COMM_READY, COMM_RECEIVE, COMM_SEND,
    COMM_WAITING,
};

use crate::address::remote;
use crate::remote::{RemoteError, RemoteSimulation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommKind {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommState {
    Waiting,
    Ready,
    Done,
}

/// Local copy of one communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommInfo {
    pub address: u64,
    pub kind: CommKind,
    pub state: CommState,
    pub mailbox: u64,
    pub src_actor: Option<u64>,
    pub dst_actor: Option<u64>,
    pub src_buff: u64,
    pub dst_buff: u64,
    pub data_size: u64,
    pub tag: u64,
    /// The sender does not wait for the transfer.
    pub detached: bool,
}

impl CommInfo {
    pub fn from_record(address: u64, record: &CommRecord) -> Result<Self, RemoteError> {
        let kind = match record.kind {
            COMM_SEND => CommKind::Send,
            COMM_RECEIVE => CommKind::Receive,
            other => {
                return Err(RemoteError::Inconsistent(format!(
                    "comm {address:#x} has unknown kind {other}"
                )))
            }
        };
        let state = match record.state {
            COMM_WAITING => CommState::Waiting,
            COMM_READY => CommState::Ready,
            COMM_DONE => CommState::Done,
            other => {
                return Err(RemoteError::Inconsistent(format!(
                    "comm {address:#x} has unknown state {other}"
                )))
            }
        };
        let actor = |pid: u64| (pid != 0).then_some(pid);
        Ok(Self {
            address,
            kind,
            state,
            mailbox: record.mailbox,
            src_actor: actor(record.src_actor),
            dst_actor: actor(record.dst_actor),
            src_buff: record.src_buff,
            dst_buff: record.dst_buff,
            data_size: record.data_size,
            tag: record.tag,
            detached: record.detached != 0,
        })
    }

    /// Both endpoints are known, so a wait on it can complete.
    pub fn is_matched(&self) -> bool {
        self.src_actor.is_some() && self.dst_actor.is_some()
    }

    /// A detached send the simulation already delivered on its own.
    pub fn is_detached_ready(&self) -> bool {
        self.detached && self.src_actor.is_none() && self.state == CommState::Ready
    }

    pub fn read(process: &RemoteSimulation, address: u64) -> Result<Self, RemoteError> {
        let record: CommRecord = process.read(remote(address))?;
        Self::from_record(address, &record)
    }
}

/// A simcall as seen by the checker.
#[derive(Debug, Clone, PartialEq)]
pub struct Simcall {
    pub call: SimcallCall,
    pub issuer: u64,
    pub mailbox: u64,
    pub comm: u64,
    pub comms: Vec<u64>,
    /// Negative when the wait has no timeout.
    pub timeout: f64,
    pub buffer: u64,
    pub buffer_size: u64,
    pub min: i64,
    pub max: i64,
    pub mutex: u64,
    pub result: u64,
    /// Content of `comm`, when there is one.
    pub comm_info: Option<CommInfo>,
    /// Content of `comms`, in the same order.
    pub comms_info: Vec<CommInfo>,
}

impl Simcall {
    pub fn none(issuer: u64) -> Self {
        Self {
            call: SimcallCall::None,
            issuer,
            mailbox: 0,
            comm: 0,
            comms: Vec::new(),
            timeout: -1.0,
            buffer: 0,
            buffer_size: 0,
            min: 0,
            max: 0,
            mutex: 0,
            result: 0,
            comm_info: None,
            comms_info: Vec::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.call == SimcallCall::None
    }

    /// Decode the scalar fields of `record`, leaving comm contents empty.
    pub fn from_record(record: &SimcallRecord) -> Result<Self, RemoteError> {
        let call = SimcallCall::from_u32(record.call).ok_or_else(|| {
            RemoteError::Inconsistent(format!("unknown simcall {}", record.call))
        })?;
        Ok(Self {
            call,
            issuer: record.issuer,
            mailbox: record.mailbox,
            comm: record.comm,
            comms: Vec::new(),
            timeout: record.timeout,
            buffer: record.buffer,
            buffer_size: record.buffer_size,
            min: record.min,
            max: record.max,
            mutex: record.mutex,
            result: record.result,
            comm_info: None,
            comms_info: Vec::new(),
        })
    }

    /// Decode `record` and fetch the comms it refers to.
    pub fn read(process: &RemoteSimulation, record: &SimcallRecord) -> Result<Self, RemoteError> {
        let mut simcall = Self::from_record(record)?;
        if record.comm != 0 {
            simcall.comm_info = Some(CommInfo::read(process, record.comm)?);
        }
        if record.comms != 0 && record.comm_count > 0 {
            simcall.comms = process.read_array(remote::<u64>(record.comms), record.comm_count as usize)?;
            simcall.comms_info = simcall
                .comms
                .iter()
                .map(|&address| CommInfo::read(process, address))
                .collect::<Result<_, _>>()?;
        }
        Ok(simcall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm(kind: u32, src: u64, dst: u64) -> CommRecord {
        CommRecord {
            kind,
            state: COMM_WAITING,
            mailbox: 0x40,
            src_actor: src,
            dst_actor: dst,
            ..Default::default()
        }
    }

    #[test]
    fn comm_endpoints_zero_means_unknown() {
        let info = CommInfo::from_record(0x1000, &comm(COMM_SEND, 1, 0)).unwrap();
        assert_eq!(info.kind, CommKind::Send);
        assert_eq!(info.src_actor, Some(1));
        assert_eq!(info.dst_actor, None);
        assert!(!info.is_matched());

        let info = CommInfo::from_record(0x1000, &comm(COMM_RECEIVE, 1, 2)).unwrap();
        assert!(info.is_matched());
    }

    #[test]
    fn unknown_comm_kind_is_inconsistent() {
        assert!(matches!(
            CommInfo::from_record(0x10, &comm(7, 0, 0)),
            Err(RemoteError::Inconsistent(_))
        ));
    }

    #[test]
    fn decodes_simcall_record() {
        let record = SimcallRecord {
            call: SimcallCall::Random as u32,
            issuer: 3,
            min: 1,
            max: 4,
            ..Default::default()
        };
        let simcall = Simcall::from_record(&record).unwrap();
        assert_eq!(simcall.call, SimcallCall::Random);
        assert_eq!((simcall.issuer, simcall.min, simcall.max), (3, 1, 4));
        assert!(!simcall.is_none());

        let bad = SimcallRecord { call: 99, ..Default::default() };
        assert!(Simcall::from_record(&bad).is_err());
    }

    #[test]
    fn reads_comms_from_memory() {
        use crate::channel::Channel;
        use nix::unistd::getpid;

        let (ours, _peer) = Channel::pair().unwrap();
        let process = RemoteSimulation::new(getpid(), ours).unwrap();
        let comms = Box::new([comm(COMM_SEND, 1, 2), comm(COMM_RECEIVE, 0, 2)]);
        let first = &comms[0] as *const CommRecord as u64;
        let second = &comms[1] as *const CommRecord as u64;
        let addresses = Box::new([first, second]);

        let record = SimcallRecord {
            call: SimcallCall::CommWaitany as u32,
            issuer: 2,
            comms: addresses.as_ptr() as u64,
            comm_count: 2,
            ..Default::default()
        };
        let simcall = Simcall::read(&process, &record).unwrap();
        assert_eq!(simcall.comms, [first, second]);
        assert!(simcall.comms_info[0].is_matched());
        assert!(!simcall.comms_info[1].is_matched());
        assert!(simcall.comm_info.is_none());
    }
}
