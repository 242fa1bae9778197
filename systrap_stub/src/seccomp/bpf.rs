// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A small classic-BPF assembler with symbolic jump targets, and an interpreter for the
//! instructions it emits.

use seccompiler::{BpfProgram, sock_filter};
use thiserror::Error;

pub(crate) const BPF_LD: u16 = 0x00;
pub(crate) const BPF_JMP: u16 = 0x05;
pub(crate) const BPF_RET: u16 = 0x06;

pub(crate) const BPF_W: u16 = 0x00;
pub(crate) const BPF_ABS: u16 = 0x20;

pub(crate) const BPF_JA: u16 = 0x00;
pub(crate) const BPF_JEQ: u16 = 0x10;
pub(crate) const BPF_JGT: u16 = 0x20;

pub(crate) const BPF_K: u16 = 0x00;

const BPF_CLASS_MASK: u16 = 0x07;

/// Longest program the kernel accepts.
pub const BPF_MAXINSNS: usize = 4096;

/// Size of `struct seccomp_data`.
pub const SECCOMP_DATA_SIZE: usize = 64;

pub(crate) const OFFSET_NR: u32 = 0;
pub(crate) const OFFSET_ARCH: u32 = 4;
pub(crate) const OFFSET_IP: u32 = 8;
pub(crate) const OFFSET_ARGS: u32 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("jump from instruction {from} to {to} does not go forward")]
    BackwardJump { from: usize, to: usize },
    #[error("label {0} was never bound")]
    UnboundLabel(usize),
    #[error("program has {0} instructions, more than the kernel accepts")]
    TooLong(usize),
}

/// A position in the program that jumps can refer to before it is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Where a conditional branch goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The following instruction.
    Next,
    Label(Label),
}

struct Insn {
    code: u16,
    k: u32,
    jt: Target,
    jf: Target,
}

impl Insn {
    fn is_branch(&self) -> bool {
        self.code & BPF_CLASS_MASK == BPF_JMP
    }
}

#[derive(Default)]
pub struct Assembler {
    insns: Vec<Insn>,
    labels: Vec<Option<usize>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Make `label` refer to the next instruction emitted.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.insns.len());
    }

    fn push(&mut self, code: u16, k: u32, jt: Target, jf: Target) {
        self.insns.push(Insn { code, k, jt, jf });
    }

    /// `A = seccomp_data[offset]`.
    pub fn load(&mut self, offset: u32) {
        self.push(BPF_LD | BPF_W | BPF_ABS, offset, Target::Next, Target::Next);
    }

    pub fn jump_eq(&mut self, k: u32, jt: Target, jf: Target) {
        self.push(BPF_JMP | BPF_JEQ | BPF_K, k, jt, jf);
    }

    /// Unsigned `A > k`.
    pub fn jump_gt(&mut self, k: u32, jt: Target, jf: Target) {
        self.push(BPF_JMP | BPF_JGT | BPF_K, k, jt, jf);
    }

    pub fn ret(&mut self, action: u32) {
        self.push(BPF_RET | BPF_K, action, Target::Next, Target::Next);
    }

    /// Resolve every label into relative offsets.
    ///
    /// Branch offsets are only 8 bits wide. A branch whose target is further away goes through an
    /// unconditional `BPF_JA` (32-bit offset) placed right after it.
    pub fn finish(self) -> Result<BpfProgram, BuildError> {
        let targets = self
            .insns
            .iter()
            .enumerate()
            .map(|(pc, insn)| Ok([self.resolve(pc, insn.jt)?, self.resolve(pc, insn.jf)?]))
            .collect::<Result<Vec<[usize; 2]>, BuildError>>()?;

        // Which branch edges need a trampoline. Adding one only moves later code further away,
        // so this only ever grows and the loop terminates.
        let mut far = vec![[false; 2]; self.insns.len()];
        let pos = loop {
            let pos = Self::layout(&far);
            let mut changed = false;
            for (pc, insn) in self.insns.iter().enumerate() {
                if !insn.is_branch() {
                    continue;
                }
                for edge in 0..2 {
                    let distance = pos[targets[pc][edge]] - (pos[pc] + 1);
                    if !far[pc][edge] && distance > usize::from(u8::MAX) {
                        far[pc][edge] = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                break pos;
            }
        };
        let len = pos[self.insns.len()];
        if len > BPF_MAXINSNS {
            return Err(BuildError::TooLong(len));
        }

        let mut prog = Vec::with_capacity(len);
        for (pc, insn) in self.insns.iter().enumerate() {
            if !insn.is_branch() {
                prog.push(sock_filter {
                    code: insn.code,
                    jt: 0,
                    jf: 0,
                    k: insn.k,
                });
                continue;
            }
            let mut trampolines = 0u8;
            let mut offsets = [0u8; 2];
            for edge in 0..2 {
                offsets[edge] = if far[pc][edge] {
                    trampolines += 1;
                    trampolines - 1
                } else {
                    // Fits: checked by the layout loop.
                    #[allow(clippy::cast_possible_truncation)]
                    let off = (pos[targets[pc][edge]] - (pos[pc] + 1)) as u8;
                    off
                };
            }
            prog.push(sock_filter {
                code: insn.code,
                jt: offsets[0],
                jf: offsets[1],
                k: insn.k,
            });
            for edge in (0..2).filter(|&edge| far[pc][edge]) {
                let from = prog.len();
                let off = pos[targets[pc][edge]] - (from + 1);
                prog.push(sock_filter {
                    code: BPF_JMP | BPF_JA,
                    jt: 0,
                    jf: 0,
                    k: u32::try_from(off).map_err(|_| BuildError::TooLong(len))?,
                });
            }
        }
        Ok(prog)
    }

    /// Index of the instruction `target` refers to, before any trampolines are inserted.
    fn resolve(&self, pc: usize, target: Target) -> Result<usize, BuildError> {
        let to = match target {
            Target::Next => return Ok(pc + 1),
            Target::Label(Label(l)) => self.labels[l].ok_or(BuildError::UnboundLabel(l))?,
        };
        // cBPF only jumps forward.
        if to <= pc {
            return Err(BuildError::BackwardJump { from: pc, to });
        }
        Ok(to)
    }

    /// Final position of every instruction (and of the end of the program) once the trampolines
    /// marked in `far` are inserted.
    fn layout(far: &[[bool; 2]]) -> Vec<usize> {
        let mut pos = Vec::with_capacity(far.len() + 1);
        let mut next = 0;
        for edges in far {
            pos.push(next);
            next += 1 + edges.iter().filter(|&&f| f).count();
        }
        pos.push(next);
        pos
    }
}

/// The input a seccomp filter sees for one syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

impl SeccompData {
    /// The in-memory layout of `struct seccomp_data`.
    pub fn to_bytes(&self) -> [u8; SECCOMP_DATA_SIZE] {
        let mut bytes = [0u8; SECCOMP_DATA_SIZE];
        bytes[0..4].copy_from_slice(&self.nr.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.arch.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.instruction_pointer.to_ne_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            let start = OFFSET_ARGS as usize + 8 * i;
            bytes[start..start + 8].copy_from_slice(&arg.to_ne_bytes());
        }
        bytes
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("instruction {pc} ({code:#06x}) is not supported")]
    Unsupported { pc: usize, code: u16 },
    #[error("instruction {pc} loads from invalid offset {offset}")]
    BadLoad { pc: usize, offset: u32 },
    #[error("execution ran past the end of the program")]
    FellOffEnd,
}

/// Run `program` over `data` the way the kernel would, returning the action.
pub fn evaluate(program: &[sock_filter], data: &SeccompData) -> Result<u32, EvalError> {
    let bytes = data.to_bytes();
    let mut a: u32 = 0;
    let mut pc = 0;
    while let Some(insn) = program.get(pc) {
        let next = pc + 1;
        let branch = |taken: bool| next + usize::from(if taken { insn.jt } else { insn.jf });
        pc = match insn.code {
            c if c == BPF_LD | BPF_W | BPF_ABS => {
                let offset = insn.k as usize;
                if offset % 4 != 0 || offset + 4 > SECCOMP_DATA_SIZE {
                    return Err(EvalError::BadLoad { pc, offset: insn.k });
                }
                let mut word = [0u8; 4];
                word.copy_from_slice(&bytes[offset..offset + 4]);
                a = u32::from_ne_bytes(word);
                next
            }
            c if c == BPF_JMP | BPF_JA => next + insn.k as usize,
            c if c == BPF_JMP | BPF_JEQ | BPF_K => branch(a == insn.k),
            c if c == BPF_JMP | BPF_JGT | BPF_K => branch(a > insn.k),
            c if c == BPF_RET | BPF_K => return Ok(insn.k),
            code => return Err(EvalError::Unsupported { pc, code }),
        };
    }
    Err(EvalError::FellOffEnd)
}
