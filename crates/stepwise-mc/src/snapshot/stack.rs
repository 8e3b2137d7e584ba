//! Frame-pointer unwinding of actor stacks.
//!
//! Every frame starts with the saved frame pointer followed by the return
//! address, so the walk needs only two reads per frame.  Checked programs
//! must be built with frame pointers.

use stepwise_protocol::layout::{SavedContext, CONTEXT_WRAPPER_SYMBOL};

use crate::address::remote;
use crate::object_info::{Frame, TypeId, VariableLocation};
use crate::remote::{ProcessIndex, RemoteSimulation};

use super::SnapshotError;

const MAX_FRAMES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub ip: u64,
    pub sp: u64,
    pub frame_base: u64,
    /// Resolved function, empty when unknown.
    pub frame_name: String,
}

/// A local variable in scope in one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    /// Entry address of the enclosing function.
    pub subprogram: u64,
    pub ip: u64,
    pub name: String,
    pub type_id: Option<TypeId>,
    pub object_index: Option<usize>,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct StackSnapshot {
    pub frames: Vec<StackFrame>,
    pub local_variables: Vec<LocalVariable>,
    pub process_index: ProcessIndex,
}

/// Walk frames from `context`.
///
/// With a landmark, the walk must reach a frame of that function; without
/// one, it stops quietly at the first unreadable or null frame.
pub fn unwind(
    process: &RemoteSimulation,
    context: SavedContext,
    landmark: Option<&str>,
) -> Result<Vec<StackFrame>, SnapshotError> {
    let mut frames = Vec::new();
    let (mut ip, mut sp, mut fp) = (context.ip, context.sp, context.fp);
    loop {
        let frame_name = process
            .find_function(ip)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let reached = landmark.is_some_and(|l| l == frame_name);
        frames.push(StackFrame {
            ip,
            sp,
            frame_base: fp,
            frame_name,
        });
        if reached {
            return Ok(frames);
        }
        if frames.len() >= MAX_FRAMES {
            return Err(SnapshotError::Unwind(format!(
                "more than {MAX_FRAMES} frames from ip {:#x}",
                context.ip
            )));
        }

        let next = if fp == 0 {
            None
        } else {
            match (
                process.read::<u64>(remote(fp)),
                process.read::<u64>(remote(fp.wrapping_add(8))),
            ) {
                (Ok(prev_fp), Ok(ret)) if ret != 0 => Some((prev_fp, ret)),
                _ => None,
            }
        };
        match next {
            Some((prev_fp, ret)) => {
                sp = fp.wrapping_add(16);
                ip = ret;
                fp = prev_fp;
            }
            None if landmark.is_some() => {
                return Err(SnapshotError::UnexpectedEndOfStack { ip });
            }
            None => return Ok(frames),
        }
    }
}

/// Unwind every registered stack down to the context wrapper.
///
/// Returns the stacks and, for each, the number of bytes in use.
pub fn take_stacks(
    process: &RemoteSimulation,
) -> Result<(Vec<StackSnapshot>, Vec<u64>), SnapshotError> {
    let mut stacks = Vec::new();
    let mut sizes = Vec::new();
    for area in process.stack_areas() {
        let context: SavedContext = process.read(remote(area.context))?;
        let frames = unwind(process, context, Some(CONTEXT_WRAPPER_SYMBOL))?;
        let mut local_variables = Vec::new();
        for frame in &frames {
            let object = process
                .object_infos()
                .iter()
                .position(|o| o.contains_exec(frame.ip));
            if let Some(function) = process.find_function(frame.ip) {
                fill_local_variables(frame, function, function.low_pc, object, &mut local_variables);
            }
        }
        let sp = frames.first().map_or(area.address + area.size, |f| f.sp);
        sizes.push((area.address + area.size).saturating_sub(sp));
        stacks.push(StackSnapshot {
            frames,
            local_variables,
            process_index: ProcessIndex::from_raw(area.process_index),
        });
    }
    Ok((stacks, sizes))
}

fn fill_local_variables(
    frame: &StackFrame,
    scope: &Frame,
    subprogram: u64,
    object: Option<usize>,
    out: &mut Vec<LocalVariable>,
) {
    if !scope.contains(frame.ip) {
        return;
    }
    for variable in &scope.variables {
        // Not yet valid at this instruction.
        if scope.low_pc + variable.start_scope > frame.ip {
            continue;
        }
        let address = match variable.location {
            VariableLocation::Address(a) => a,
            VariableLocation::FrameOffset(offset) => frame.frame_base.wrapping_add_signed(offset),
        };
        out.push(LocalVariable {
            subprogram,
            ip: frame.ip,
            name: variable.name.clone(),
            type_id: variable.type_id,
            object_index: object,
            address,
            size: variable.size,
        });
    }
    for nested in &scope.scopes {
        fill_local_variables(frame, nested, subprogram, object, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_info::Variable;

    #[test]
    fn locals_respect_scope_start_and_nesting() {
        let mut function = Frame::new("work", 0x1000, 0x1100);
        let mut early = Variable::local("early", -8, 8);
        early.start_scope = 0;
        let mut late = Variable::local("late", -16, 8);
        late.start_scope = 0x80;
        function.variables.push(early);
        function.variables.push(late);
        let mut block = Frame::new("work", 0x1010, 0x1040);
        block.variables.push(Variable::local("inner", -24, 4));
        function.scopes.push(block);

        let frame = StackFrame {
            ip: 0x1020,
            sp: 0x7000,
            frame_base: 0x7100,
            frame_name: "work".into(),
        };
        let mut out = Vec::new();
        fill_local_variables(&frame, &function, 0x1000, Some(0), &mut out);
        let names: Vec<_> = out.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["early", "inner"]);
        assert_eq!(out[0].address, 0x70f8);
        assert_eq!(out[1].address, 0x70e8);
    }
}
