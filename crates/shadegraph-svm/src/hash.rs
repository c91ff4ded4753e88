//! Content hashes of compiled programs.
//!
//! Instruction words are fed little-endian in program order, so equal
//! programs hash equally on every platform.

use shadegraph_core::BytecodeProgram;

pub fn program_hash(program: &BytecodeProgram) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for instruction in &program.instructions {
        for word in instruction {
            hasher.update(&word.to_le_bytes());
        }
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tracks_instruction_words() {
        let a = BytecodeProgram { instructions: vec![[1, 2, 3, 4]], ..Default::default() };
        let mut b = a.clone();
        assert_eq!(program_hash(&a), program_hash(&b));
        b.instructions[0][3] = 5;
        assert_ne!(program_hash(&a), program_hash(&b));
    }
}
