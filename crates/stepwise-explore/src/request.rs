//! Simcalls as transitions: the dependency relation used by DPOR and the
//! human-readable renderings used in traces and dot graphs.

use std::collections::BTreeMap;

use log::Level;
use stepwise_mc::{CommInfo, CommKind, Simcall};
use stepwise_protocol::layout::SimcallCall;

use crate::session::ActorInfo;

// ═══════════════════════════════════════════════════════════════════════
//  Dependency
// ═══════════════════════════════════════════════════════════════════════

fn same_buffers(c1: Option<&CommInfo>, c2: Option<&CommInfo>) -> bool {
    match (c1, c2) {
        (Some(c1), Some(c2)) => c1.src_buff == c2.src_buff && c1.dst_buff == c2.dst_buff,
        (None, None) => true,
        _ => false,
    }
}

/// One direction of the dependency between simcalls of different kinds.
fn depend_asymmetric(r1: &Simcall, r2: &Simcall) -> bool {
    use SimcallCall::*;

    if matches!((r1.call, r2.call), (CommIsend, CommIrecv) | (CommIrecv, CommIsend)) {
        return false;
    }

    let c1 = r1.comm_info.as_ref();
    let c2 = r2.comm_info.as_ref();

    if matches!(r1.call, CommIsend | CommIrecv) && r2.call == CommWait {
        if let Some(c2) = c2 {
            let no_timeout = r2.timeout <= 0.0;
            if r1.mailbox != c2.mailbox && no_timeout {
                return false;
            }
            if c2.src_actor != Some(r1.issuer) && c2.dst_actor != Some(r1.issuer) && no_timeout {
                return false;
            }
            if r1.call == CommIsend
                && c2.kind == CommKind::Send
                && c2.src_buff != r1.buffer
                && no_timeout
            {
                return false;
            }
            if r1.call == CommIrecv
                && c2.kind == CommKind::Receive
                && c2.dst_buff != r1.buffer
                && no_timeout
            {
                return false;
            }
        }
    }

    // Assumes the comm returned by isend/irecv is not the one being tested.
    if matches!(r1.call, CommIsend | CommIrecv) && r2.call == CommTest {
        return false;
    }

    if r1.call == CommWait
        && matches!(r2.call, CommWait | CommTest)
        && c1.is_some_and(|c| !c.is_matched())
    {
        return false;
    }

    if r1.call == CommTest && c1.map_or(true, |c| c.src_buff == 0 || c.dst_buff == 0) {
        return false;
    }

    if matches!((r1.call, r2.call), (CommTest, CommWait) | (CommWait, CommTest))
        && same_buffers(c1, c2)
    {
        return false;
    }

    true
}

/// Whether executing `r1` and `r2` in either order may lead to different
/// states.
pub fn request_depend(r1: &Simcall, r2: &Simcall) -> bool {
    use SimcallCall::*;

    if r1.issuer == r2.issuer {
        return false;
    }

    // Timeouts are outside the independence theorem.
    if (r1.call == CommWait && r1.timeout > 0.0) || (r2.call == CommWait && r2.timeout > 0.0) {
        return true;
    }

    if r1.call != r2.call {
        return depend_asymmetric(r1, r2) && depend_asymmetric(r2, r1);
    }

    match r1.call {
        CommIsend | CommIrecv => r1.mailbox == r2.mailbox,
        CommWait => {
            let (Some(c1), Some(c2)) = (r1.comm_info.as_ref(), r2.comm_info.as_ref()) else {
                return true;
            };
            if c1.src_buff == c2.src_buff && c1.dst_buff == c2.dst_buff {
                return false;
            }
            let all_set = c1.src_buff != 0 && c1.dst_buff != 0 && c2.src_buff != 0 && c2.dst_buff != 0;
            !(all_set
                && c1.dst_buff != c2.src_buff
                && c1.dst_buff != c2.dst_buff
                && c2.dst_buff != c1.src_buff)
        }
        _ => true,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Rendering
// ═══════════════════════════════════════════════════════════════════════

/// Names and hosts of every actor seen so far, kept after they exit so
/// traces stay readable.
#[derive(Debug, Clone, Default)]
pub struct ActorNames {
    names: BTreeMap<u64, (String, String)>,
}

impl ActorNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learn(&mut self, actors: &[ActorInfo]) {
        for actor in actors {
            self.names
                .entry(actor.pid)
                .or_insert_with(|| (actor.name.clone(), actor.host.clone()));
        }
    }

    pub fn name(&self, pid: u64) -> &str {
        self.names.get(&pid).map_or("", |(name, _)| name)
    }

    pub fn host(&self, pid: u64) -> &str {
        self.names.get(&pid).map_or("", |(_, host)| host)
    }

    /// `(pid)host (name)`
    fn describe(&self, pid: u64) -> String {
        format!("({pid}){} ({})", self.host(pid), self.name(pid))
    }

    fn describe_opt(&self, pid: Option<u64>) -> String {
        match pid {
            Some(pid) => self.describe(pid),
            None => "(0) ()".to_owned(),
        }
    }
}

/// Addresses and sizes change from run to run; only show them when asked.
fn verbose(value: u64, hex: bool) -> String {
    if !log::log_enabled!(Level::Debug) {
        return "(verbose only)".to_owned();
    }
    if hex {
        format!("{value:#x}")
    } else {
        value.to_string()
    }
}

/// `[(pid)host (name)] Kind(arguments)`
pub fn request_to_string(req: &Simcall, value: i32, names: &ActorNames) -> String {
    use SimcallCall as C;

    let issuer = req.issuer;
    let (kind, args): (&str, Option<String>) = match req.call {
        C::CommIsend => (
            "iSend",
            Some(format!(
                "src={}, buff={}, size={}",
                names.describe(issuer),
                verbose(req.buffer, true),
                verbose(req.buffer_size, false)
            )),
        ),
        C::CommIrecv => (
            "iRecv",
            Some(format!(
                "dst={}, buff={}, size={}",
                names.describe(issuer),
                verbose(req.buffer, true),
                verbose(req.buffer_size, false)
            )),
        ),
        C::CommWait if value == -1 => {
            ("WaitTimeout", Some(format!("comm={}", verbose(req.comm, true))))
        }
        C::CommWait => {
            let comm = req.comm_info.as_ref();
            (
                "Wait",
                Some(format!(
                    "comm={} [{}-> {}]",
                    verbose(req.comm, true),
                    names.describe_opt(comm.and_then(|c| c.src_actor)),
                    names.describe_opt(comm.and_then(|c| c.dst_actor))
                )),
            )
        }
        C::CommTest => match req.comm_info.as_ref() {
            Some(comm) if comm.is_matched() => (
                "Test TRUE",
                Some(format!(
                    "comm={} [{} -> {}]",
                    verbose(req.comm, true),
                    names.describe_opt(comm.src_actor),
                    names.describe_opt(comm.dst_actor)
                )),
            ),
            _ => ("Test FALSE", Some(format!("comm={}", verbose(req.comm, true)))),
        },
        C::CommWaitany => {
            let comm = usize::try_from(value)
                .ok()
                .and_then(|i| req.comms.get(i))
                .copied()
                .unwrap_or(0);
            (
                "WaitAny",
                Some(format!(
                    "comm={} ({} of {})",
                    verbose(comm, true),
                    value + 1,
                    req.comms.len()
                )),
            )
        }
        C::CommTestany if value == -1 => ("TestAny FALSE", Some("-".to_owned())),
        C::CommTestany => (
            "TestAny",
            Some(format!("({} of {})", value + 1, req.comms.len())),
        ),
        C::MutexLock | C::MutexTrylock | C::MutexUnlock => {
            let kind = match req.call {
                C::MutexLock => "Mutex LOCK",
                C::MutexTrylock => "Mutex TRYLOCK",
                _ => "Mutex UNLOCK",
            };
            (kind, Some(format!("mutex={}", verbose(req.mutex, true))))
        }
        C::Random => ("MC_RANDOM", Some(value.to_string())),
        C::Execute => ("Execute", None),
        C::None => ("None", None),
    };

    match args {
        Some(args) => format!("[{}] {kind}({args})", names.describe(issuer)),
        None => format!("[{}] {kind} ", names.describe(issuer)),
    }
}

const COLORS: [&str; 13] = [
    "blue",
    "red",
    "green3",
    "goldenrod",
    "brown",
    "purple",
    "magenta",
    "turquoise4",
    "gray25",
    "forestgreen",
    "hotpink",
    "lightblue",
    "tan",
];

fn color(pid: u64) -> &'static str {
    COLORS[(pid.saturating_sub(1) % COLORS.len() as u64) as usize]
}

/// Edge attributes of a transition in the dot graph.
pub fn request_get_dot_output(req: &Simcall, value: i32, names: &ActorNames) -> String {
    use SimcallCall as C;

    let issuer = req.issuer;
    let who = format!("[({issuer}){}]", names.host(issuer));
    let label = match req.call {
        C::CommIsend => format!("{who} iSend"),
        C::CommIrecv => format!("{who} iRecv"),
        C::CommWait if value == -1 => format!("{who} WaitTimeout"),
        C::CommWait => {
            let comm = req.comm_info.as_ref();
            format!(
                "{who} Wait [({})->({})]",
                comm.and_then(|c| c.src_actor).unwrap_or(0),
                comm.and_then(|c| c.dst_actor).unwrap_or(0)
            )
        }
        C::CommTest => match req.comm_info.as_ref() {
            Some(comm) if comm.is_matched() => format!("{who} Test TRUE"),
            _ => format!("{who} Test FALSE"),
        },
        C::CommWaitany => format!("{who} WaitAny [{} of {}]", value + 1, req.comms.len()),
        C::CommTestany if value == -1 => format!("{who} TestAny FALSE"),
        C::CommTestany => format!("{who} TestAny TRUE [{} of {}]", value + 1, req.comms.len()),
        C::MutexLock => format!("[({issuer})] Mutex LOCK"),
        C::MutexTrylock => format!("[({issuer})] Mutex TRYLOCK"),
        C::MutexUnlock => format!("[({issuer})] Mutex UNLOCK"),
        C::Random => format!("{who} MC_RANDOM ({value})"),
        C::Execute => format!("{who} Execute"),
        C::None => format!("{who} None"),
    };
    let color = color(issuer);
    format!("label = \"{label}\", color = {color}, fontcolor = {color}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_mc::CommState;

    fn simcall(call: SimcallCall, issuer: u64) -> Simcall {
        Simcall {
            call,
            ..Simcall::none(issuer)
        }
    }

    fn send(issuer: u64, mailbox: u64) -> Simcall {
        Simcall {
            mailbox,
            buffer: 0x100 * issuer,
            ..simcall(SimcallCall::CommIsend, issuer)
        }
    }

    fn recv(issuer: u64, mailbox: u64) -> Simcall {
        Simcall {
            mailbox,
            buffer: 0x100 * issuer,
            ..simcall(SimcallCall::CommIrecv, issuer)
        }
    }

    fn comm(src: Option<u64>, dst: Option<u64>, mailbox: u64) -> CommInfo {
        CommInfo {
            address: 0xc000,
            kind: CommKind::Send,
            state: CommState::Ready,
            mailbox,
            src_actor: src,
            dst_actor: dst,
            src_buff: src.map_or(0, |p| 0x100 * p),
            dst_buff: dst.map_or(0, |p| 0x100 * p),
            data_size: 8,
            tag: 0,
            detached: false,
        }
    }

    fn wait(issuer: u64, comm: CommInfo) -> Simcall {
        Simcall {
            comm: comm.address,
            comm_info: Some(comm),
            ..simcall(SimcallCall::CommWait, issuer)
        }
    }

    #[test]
    fn same_issuer_is_independent() {
        let a = simcall(SimcallCall::MutexLock, 1);
        assert!(!request_depend(&a, &a.clone()));
    }

    #[test]
    fn sends_depend_on_shared_mailbox() {
        assert!(request_depend(&send(1, 7), &send(2, 7)));
        assert!(!request_depend(&send(1, 7), &send(2, 8)));
        assert!(request_depend(&recv(1, 7), &recv(2, 7)));
        assert!(!request_depend(&send(1, 7), &recv(2, 7)));
    }

    #[test]
    fn waits_with_timeout_depend_on_everything() {
        let mut w = wait(2, comm(Some(2), Some(3), 9));
        w.timeout = 1.5;
        assert!(request_depend(&send(1, 7), &w));
        assert!(request_depend(&w, &simcall(SimcallCall::Random, 4)));
    }

    #[test]
    fn send_and_unrelated_wait_are_independent() {
        let w = wait(3, comm(Some(2), Some(3), 9));
        assert!(!request_depend(&send(1, 7), &w));
        assert!(!request_depend(&w, &send(1, 7)));
        // Same mailbox, but the sender is neither endpoint of the comm.
        assert!(!request_depend(&send(1, 9), &w));
    }

    #[test]
    fn waits_on_half_matched_comms_are_independent() {
        let w1 = wait(1, comm(Some(1), None, 9));
        let mut test = simcall(SimcallCall::CommTest, 2);
        test.comm_info = Some(comm(Some(2), Some(3), 9));
        assert!(!request_depend(&w1, &test));
    }

    #[test]
    fn waits_on_the_same_comm_are_independent() {
        let c = comm(Some(1), Some(2), 9);
        assert!(!request_depend(&wait(1, c), &wait(2, c)));
        let other = CommInfo {
            src_buff: 0x300,
            dst_buff: 0x500,
            ..c
        };
        // Second comm reads into the buffer the first one sends from.
        let crossed = CommInfo {
            src_buff: 0x300,
            dst_buff: c.src_buff,
            ..c
        };
        assert!(!request_depend(&wait(1, c), &wait(2, other)));
        assert!(request_depend(&wait(1, c), &wait(2, crossed)));
    }

    #[test]
    fn mutex_and_random_are_dependent() {
        let lock = simcall(SimcallCall::MutexLock, 1);
        let unlock = simcall(SimcallCall::MutexUnlock, 2);
        assert!(request_depend(&lock, &unlock));
        assert!(request_depend(
            &simcall(SimcallCall::Random, 1),
            &simcall(SimcallCall::Random, 2)
        ));
    }

    fn names() -> ActorNames {
        let mut names = ActorNames::new();
        names.learn(&[
            ActorInfo {
                pid: 1,
                name: "client".into(),
                host: "Tremblay".into(),
                simcall: Simcall::none(1),
            },
            ActorInfo {
                pid: 2,
                name: "server".into(),
                host: "Jupiter".into(),
                simcall: Simcall::none(2),
            },
        ]);
        names
    }

    #[test]
    fn renders_requests_with_actor_identity() {
        let names = names();
        assert_eq!(
            request_to_string(&send(1, 7), 0, &names),
            "[(1)Tremblay (client)] iSend(src=(1)Tremblay (client), buff=(verbose only), size=(verbose only))"
        );
        let w = wait(2, comm(Some(1), Some(2), 7));
        assert_eq!(
            request_to_string(&w, 0, &names),
            "[(2)Jupiter (server)] Wait(comm=(verbose only) [(1)Tremblay (client)-> (2)Jupiter (server)])"
        );
        assert_eq!(
            request_to_string(&w, -1, &names),
            "[(2)Jupiter (server)] WaitTimeout(comm=(verbose only))"
        );
        assert_eq!(
            request_to_string(&simcall(SimcallCall::Random, 1), 3, &names),
            "[(1)Tremblay (client)] MC_RANDOM(3)"
        );
        assert_eq!(
            request_to_string(&simcall(SimcallCall::Execute, 9), 0, &names),
            "[(9) ()] Execute "
        );
    }

    #[test]
    fn dot_labels_carry_a_color_per_actor() {
        let names = names();
        assert_eq!(
            request_get_dot_output(&send(1, 7), 0, &names),
            "label = \"[(1)Tremblay] iSend\", color = blue, fontcolor = blue"
        );
        let w = wait(2, comm(Some(1), Some(2), 7));
        assert_eq!(
            request_get_dot_output(&w, 0, &names),
            "label = \"[(2)Jupiter] Wait [(1)->(2)]\", color = red, fontcolor = red"
        );
        assert_eq!(color(14), "blue");
    }

    #[test]
    fn names_survive_actor_exit() {
        let mut names = names();
        names.learn(&[]);
        assert_eq!(names.name(2), "server");
        assert_eq!(names.host(5), "");
    }
}
