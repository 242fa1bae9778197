// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The seccomp policy confining stub threads.
//!
//! A stub thread must only be able to make the handful of syscalls its code page needs to talk to
//! the controller. Every allowed rule therefore also requires the instruction pointer to lie above
//! the stub code address: application code that somehow runs in the stub process is trapped.
//!
//! `seccompiler` cannot match on the instruction pointer, so rules are compiled here with a small
//! label-resolving assembler ([`bpf::Assembler`]) into a [`seccompiler::BpfProgram`], which is
//! then installed with [`seccompiler::apply_filter`].

pub mod bpf;

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use seccompiler::{BpfProgram, SeccompAction};

pub use bpf::{BuildError, EvalError, SeccompData, evaluate};
use bpf::{Assembler, Label, OFFSET_ARCH, OFFSET_ARGS, OFFSET_IP, OFFSET_NR, Target};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// `AUDIT_ARCH_X86_64`.
        pub const AUDIT_ARCH: u32 = 0xC000_003E;
    } else if #[cfg(target_arch = "aarch64")] {
        /// `AUDIT_ARCH_AARCH64`.
        pub const AUDIT_ARCH: u32 = 0xC000_00B7;
    } else {
        compile_error!("unsupported architecture for the stub seccomp policy");
    }
}

/// A condition on one 64-bit value of [`SeccompData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgMatcher {
    Any,
    EqualTo(u64),
    /// Unsigned, strictly greater than.
    GreaterThan(u64),
}

impl ArgMatcher {
    pub fn matches(self, value: u64) -> bool {
        match self {
            ArgMatcher::Any => true,
            ArgMatcher::EqualTo(v) => value == v,
            ArgMatcher::GreaterThan(v) => value > v,
        }
    }
}

/// All conditions that must hold together for one syscall to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub args: [ArgMatcher; 6],
    pub instruction_pointer: ArgMatcher,
}

impl Rule {
    pub const fn new(args: [ArgMatcher; 6]) -> Self {
        Self {
            args,
            instruction_pointer: ArgMatcher::Any,
        }
    }

    /// A rule that matches any arguments.
    pub const fn any() -> Self {
        Self::new([ArgMatcher::Any; 6])
    }

    #[must_use]
    pub const fn with_instruction_pointer(mut self, ip: ArgMatcher) -> Self {
        self.instruction_pointer = ip;
        self
    }

    pub fn matches(&self, data: &SeccompData) -> bool {
        self.instruction_pointer.matches(data.instruction_pointer)
            && self
                .args
                .iter()
                .zip(data.args)
                .all(|(m, arg)| m.matches(arg))
    }
}

/// Syscalls (by number) with their alternative rules, and the action taken when one matches.
///
/// A syscall with an empty rule list matches unconditionally.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub rules: BTreeMap<i64, Vec<Rule>>,
    pub action: SeccompAction,
}

impl RuleSet {
    pub fn allow(rules: BTreeMap<i64, Vec<Rule>>) -> Self {
        Self {
            rules,
            action: SeccompAction::Allow,
        }
    }
}

/// The rules for the syscalls a stub thread makes from its code page at `stub_start`.
pub fn stub_thread_rules(stub_start: usize) -> RuleSet {
    let above_stub = ArgMatcher::GreaterThan(stub_start as u64);
    let futex = |op: i32, val: ArgMatcher| {
        Rule::new([
            above_stub,
            ArgMatcher::EqualTo(u64::from(op.cast_unsigned())),
            val,
            ArgMatcher::EqualTo(0),
            ArgMatcher::EqualTo(0),
            ArgMatcher::EqualTo(0),
        ])
        .with_instruction_pointer(above_stub)
    };
    let anything = Rule::any().with_instruction_pointer(above_stub);
    RuleSet::allow(BTreeMap::from([
        (
            libc::SYS_futex,
            vec![
                futex(libc::FUTEX_WAKE, ArgMatcher::EqualTo(1)),
                futex(libc::FUTEX_WAIT, ArgMatcher::Any),
            ],
        ),
        (libc::SYS_rt_sigreturn, vec![anything.clone()]),
        (libc::SYS_sched_yield, vec![anything]),
    ]))
}

/// Compile `rule_sets` into a program that checks the architecture first and then tries each rule
/// set in order.
pub fn build_program(
    rule_sets: &[RuleSet],
    default_action: SeccompAction,
    bad_arch_action: SeccompAction,
) -> Result<BpfProgram, BuildError> {
    let mut asm = Assembler::new();
    let bad_arch = asm.label();
    asm.load(OFFSET_ARCH);
    asm.jump_eq(AUDIT_ARCH, Target::Next, Target::Label(bad_arch));

    for set in rule_sets {
        let action = u32::from(set.action.clone());
        for (&nr, rules) in &set.rules {
            let next_syscall = asm.label();
            asm.load(OFFSET_NR);
            // Syscall numbers are small and non-negative; `nr` is a 32-bit field.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let nr = nr as u32;
            asm.jump_eq(nr, Target::Next, Target::Label(next_syscall));
            if rules.is_empty() {
                asm.ret(action);
            }
            for rule in rules {
                let next_rule = asm.label();
                emit_matcher(&mut asm, OFFSET_IP, rule.instruction_pointer, next_rule);
                for (i, &matcher) in (0u32..).zip(&rule.args) {
                    emit_matcher(&mut asm, OFFSET_ARGS + 8 * i, matcher, next_rule);
                }
                asm.ret(action);
                asm.bind(next_rule);
            }
            asm.bind(next_syscall);
        }
    }

    asm.ret(u32::from(default_action));
    asm.bind(bad_arch);
    asm.ret(u32::from(bad_arch_action));
    asm.finish()
}

/// Emit a check of the 64-bit value at `offset`, jumping to `fail` if `matcher` rejects it and
/// falling through otherwise.
fn emit_matcher(asm: &mut Assembler, offset: u32, matcher: ArgMatcher, fail: Label) {
    #[allow(clippy::cast_possible_truncation)]
    fn split(v: u64) -> (u32, u32) {
        ((v >> 32) as u32, v as u32)
    }

    let (lo_off, hi_off) = if cfg!(target_endian = "little") {
        (offset, offset + 4)
    } else {
        (offset + 4, offset)
    };
    let fail = Target::Label(fail);
    match matcher {
        ArgMatcher::Any => {}
        ArgMatcher::EqualTo(v) => {
            let (hi, lo) = split(v);
            asm.load(hi_off);
            asm.jump_eq(hi, Target::Next, fail);
            asm.load(lo_off);
            asm.jump_eq(lo, Target::Next, fail);
        }
        ArgMatcher::GreaterThan(v) => {
            let (hi, lo) = split(v);
            let pass = asm.label();
            asm.load(hi_off);
            asm.jump_gt(hi, Target::Label(pass), Target::Next);
            asm.jump_eq(hi, Target::Next, fail);
            asm.load(lo_off);
            asm.jump_gt(lo, Target::Next, fail);
            asm.bind(pass);
        }
    }
}

/// The full stub-thread program: `arch_rules` followed by [`stub_thread_rules`], trapping
/// everything else (including foreign architectures).
pub fn stub_thread_program(
    stub_start: usize,
    arch_rules: &[RuleSet],
) -> Result<BpfProgram, BuildError> {
    let mut sets = arch_rules.to_vec();
    sets.push(stub_thread_rules(stub_start));
    build_program(&sets, SeccompAction::Trap, SeccompAction::Trap)
}

/// Compiled stub-thread programs, built once per stub code address.
pub struct PolicyCache {
    arch_rules: Vec<RuleSet>,
    programs: spin::Mutex<HashMap<usize, Arc<BpfProgram>>>,
}

impl PolicyCache {
    pub fn new(arch_rules: Vec<RuleSet>) -> Self {
        Self {
            arch_rules,
            programs: spin::Mutex::new(HashMap::new()),
        }
    }

    /// The program for stubs whose code page is at `stub_start`.
    pub fn get_or_build(&self, stub_start: usize) -> Result<Arc<BpfProgram>, BuildError> {
        if let Some(prog) = self.programs.lock().get(&stub_start) {
            return Ok(prog.clone());
        }
        let prog = Arc::new(stub_thread_program(stub_start, &self.arch_rules)?);
        systrap_util_log::debug!(
            "built stub seccomp program for {stub_start:#x} ({} instructions)",
            prog.len()
        );
        Ok(self
            .programs
            .lock()
            .entry(stub_start)
            .or_insert(prog)
            .clone())
    }
}

/// Install `program` on the calling thread (setting `no_new_privs` first). Irreversible.
pub fn install_on_current_thread(program: &BpfProgram) -> Result<(), seccompiler::Error> {
    seccompiler::apply_filter(program)
}
