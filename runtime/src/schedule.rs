//! Scheduler: DAG traversal, ordering and width grouping.

use crate::error::{InternalSnafu, Result};
use crate::state::EvalScratch;
use crate::state::State;
use crate::var;

/// One entry of the evaluation schedule: a variable to compute at a width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledVariable {
    pub size: u32,
    pub index: u32,
}

/// A maximal run of equal-width schedule entries; becomes one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledGroup {
    pub size: u32,
    pub start: u32,
    pub end: u32,
}

/// Depth-first traversal from `index` at evaluation width `size`.
///
/// Memoized on `(size, index)`: a variable is appended once per distinct
/// width it participates in. The `(0, index)` marker records the very first
/// visit at *any* width, at which point the output flag is cleared (the
/// caller re-marks actual roots afterwards).
///
/// Dependency slots are packed to the left and traversal stops at the first
/// empty slot; a reference-only dependency parked in the last slot is
/// therefore kept alive but never scheduled.
pub fn traverse(
    state: &mut State,
    scratch: &mut EvalScratch,
    size: u32,
    index: u32,
) -> Result<()> {
    if !scratch.visited.insert((size, index)) {
        return Ok(());
    }

    let (deps, has_extra) = {
        let v = var::get(state, index)?;
        (v.dep, v.extra)
    };

    for dep in deps {
        if dep == 0 {
            break;
        }
        traverse(state, scratch, size, dep)?;
    }

    if has_extra {
        let extra_deps = state
            .extra
            .get(&index)
            .ok_or_else(|| {
                InternalSnafu { reason: format!("missing extra record for r{index}") }.build()
            })?
            .dep
            .clone();
        for dep in extra_deps {
            if dep != 0 {
                traverse(state, scratch, size, dep)?;
            }
        }
    }

    if scratch.visited.insert((0, index)) {
        var::get_mut(state, index)?.output_flag = false;
    }

    scratch.schedule.push(ScheduledVariable { size, index });
    Ok(())
}

/// Order the schedule (descending width, ascending index, stable) and
/// partition it into maximal equal-width runs.
pub fn sort_and_group(scratch: &mut EvalScratch) {
    scratch
        .schedule
        .sort_by(|a, b| b.size.cmp(&a.size).then(a.index.cmp(&b.index)));

    scratch.groups.clear();
    let schedule = &scratch.schedule;
    if schedule.is_empty() {
        return;
    }

    if schedule[0].size == schedule[schedule.len() - 1].size {
        scratch.groups.push(ScheduledGroup {
            size: schedule[0].size,
            start: 0,
            end: schedule.len() as u32,
        });
        return;
    }

    let mut cursor = 0usize;
    for i in 1..schedule.len() {
        if schedule[i - 1].size != schedule[i].size {
            scratch.groups.push(ScheduledGroup {
                size: schedule[cursor].size,
                start: cursor as u32,
                end: i as u32,
            });
            cursor = i;
        }
    }
    scratch.groups.push(ScheduledGroup {
        size: schedule[cursor].size,
        start: cursor as u32,
        end: schedule.len() as u32,
    });
}
