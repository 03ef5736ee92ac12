//! Crypto stage (spec §4.6): symmetric encrypt/decrypt of 4 KiB data
//! blocks, driven at most once per primitive.

use cbe_crypto::BlockCipher;

use crate::model::Block;
use crate::primitive::{Primitive, Tag};

struct Job {
    primitive: Primitive,
    source: Block,
    result: Option<Block>,
}

pub struct CryptoStage {
    cipher: BlockCipher,
    job: Option<Job>,
}

impl CryptoStage {
    pub fn new(cipher: BlockCipher) -> Self {
        Self { cipher, job: None }
    }

    pub fn primitive_acceptable(&self) -> bool {
        self.job.is_none()
    }

    /// Submits `primitive` for processing. `CryptoEncrypt` encrypts
    /// `source`; `CryptoDecrypt` decrypts it.
    pub fn submit_primitive(&mut self, primitive: Primitive, source: Block) {
        debug_assert!(self.primitive_acceptable());
        debug_assert!(matches!(primitive.tag, Tag::CryptoEncrypt | Tag::CryptoDecrypt));
        self.job = Some(Job {
            primitive,
            source,
            result: None,
        });
    }

    /// Performs the encrypt/decrypt operation. Always completes within
    /// a single call (no true asynchrony), but modeled as an explicit
    /// tick so the driver's progress accounting stays uniform across
    /// stages.
    pub fn execute(&mut self) -> bool {
        let Some(job) = &mut self.job else {
            return false;
        };
        if job.result.is_some() {
            return false;
        }
        let out = match job.primitive.tag {
            Tag::CryptoEncrypt => self.cipher.encrypt_block(job.primitive.pba, job.source.as_slice()),
            Tag::CryptoDecrypt => self.cipher.decrypt_block(job.primitive.pba, job.source.as_slice()),
            _ => unreachable!("crypto stage only accepts encrypt/decrypt primitives"),
        };
        job.result = Some(Block::from_bytes(out));
        true
    }

    pub fn peek_completed_primitive(&self) -> Option<Primitive> {
        self.job
            .as_ref()
            .filter(|j| j.result.is_some())
            .map(|j| j.primitive)
    }

    pub fn copy_completed_data(&self) -> Block {
        self.job
            .as_ref()
            .and_then(|j| j.result.clone())
            .expect("crypto job completed")
    }

    pub fn drop_completed_primitive(&mut self) {
        self.job = None;
    }

    /// A one-shot decrypt bypassing job state entirely: used by the
    /// engine's snapshot-browsing path, which reads outside the tick
    /// loop and has no primitive to track.
    pub fn decrypt_now(&self, pba: crate::model::Pba, ciphertext: &Block) -> Block {
        Block::from_bytes(self.cipher.decrypt_block(pba, ciphertext.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Operation;

    fn primitive(tag: Tag, pba: u64) -> Primitive {
        Primitive::new(tag, None, Operation::Write, pba, 0)
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = BlockCipher::new([3u8; cbe_crypto::KEY_LEN]);
        let mut stage = CryptoStage::new(cipher.clone());
        let plaintext = Block::from_bytes([0xAA; 4096]);

        stage.submit_primitive(primitive(Tag::CryptoEncrypt, 9), plaintext.clone());
        assert!(stage.execute());
        let prim = stage.peek_completed_primitive().unwrap();
        let ciphertext = stage.copy_completed_data();
        stage.drop_completed_primitive();
        assert_ne!(ciphertext, plaintext);

        stage.submit_primitive(primitive(Tag::CryptoDecrypt, prim.pba), ciphertext);
        assert!(stage.execute());
        let decrypted = stage.copy_completed_data();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn refuses_second_submission_while_busy() {
        let stage_cipher = BlockCipher::new([1u8; cbe_crypto::KEY_LEN]);
        let mut stage = CryptoStage::new(stage_cipher);
        stage.submit_primitive(primitive(Tag::CryptoEncrypt, 0), Block::zeroed());
        assert!(!stage.primitive_acceptable());
    }
}
