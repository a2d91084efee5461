//! Machine code scanning for probe sites.
//!
//! Instructions are classified from decoded opcode and operand fields rather
//! than from formatted disassembly text.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind};
use object::Architecture;

/// What the resolver needs to know about one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionClass {
    Return,
    /// Direct calls carry their absolute target, indirect calls do not
    Call { target: Option<u64> },
    Other,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: u64,
    pub len: usize,
    pub class: InstructionClass,
}

impl DecodedInstruction {
    pub fn is_return(&self) -> bool {
        self.class == InstructionClass::Return
    }

    pub fn call_target(&self) -> Option<u64> {
        match self.class {
            InstructionClass::Call { target } => target,
            _ => None,
        }
    }
}

/// Decodes a byte range of machine code located at `address`
pub trait InstructionScanner {
    fn scan(&self, code: &[u8], address: u64) -> Vec<DecodedInstruction>;
}

/// Scanner for 64-bit x86 code, the only target the Go uprobe tracer supports
#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64Scanner;

impl X86_64Scanner {
    pub fn for_architecture(arch: Architecture) -> Option<Self> {
        match arch {
            Architecture::X86_64 => Some(X86_64Scanner),
            _ => None,
        }
    }

    fn classify(instruction: &Instruction) -> InstructionClass {
        if instruction.is_invalid() {
            return InstructionClass::Invalid;
        }
        match instruction.mnemonic() {
            Mnemonic::Ret | Mnemonic::Retf => InstructionClass::Return,
            _ if instruction.flow_control() == FlowControl::Call => {
                let target = match instruction.op0_kind() {
                    OpKind::NearBranch64 | OpKind::NearBranch32 | OpKind::NearBranch16 => {
                        Some(instruction.near_branch_target())
                    }
                    _ => None,
                };
                InstructionClass::Call { target }
            }
            _ => InstructionClass::Other,
        }
    }
}

impl InstructionScanner for X86_64Scanner {
    fn scan(&self, code: &[u8], address: u64) -> Vec<DecodedInstruction> {
        let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
        let mut instruction = Instruction::default();
        let mut decoded = Vec::new();

        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            decoded.push(DecodedInstruction {
                address: instruction.ip(),
                len: instruction.len(),
                class: Self::classify(&instruction),
            });
        }

        decoded
    }
}
