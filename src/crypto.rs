use aes::Aes128;
use xts_mode::{get_tweak_default, Xts128};

/// AES-XTS over 4 KiB file-system blocks. Tweak is the physical block
/// number (little-endian 128-bit, per `xts-mode`'s sector-index
/// convention); there is no chaining across blocks. The 256-bit volume
/// encryption key splits into two 128-bit AES-128 keys, matching
/// XTS-AES-128 rather than XTS-AES-256.
#[derive(Clone)]
pub struct XtsContext {
    xts: Xts128<Aes128>,
}

impl XtsContext {
    pub fn new(vek: &[u8; 32]) -> Self {
        use aes::cipher::KeyInit;

        let cipher_1 = Aes128::new_from_slice(&vek[0..16]).expect("16-byte key");
        let cipher_2 = Aes128::new_from_slice(&vek[16..32]).expect("16-byte key");
        XtsContext { xts: Xts128::new(cipher_1, cipher_2) }
    }

    /// Decrypt a 4096-byte block in place, tweaked by its physical block number.
    pub fn decrypt_block(&self, block_number: u64, data: &mut [u8; 4096]) {
        let tweak = get_tweak_default(block_number as u128);
        self.xts.decrypt_sector(data, tweak);
    }

    /// Encrypt a 4096-byte block in place. Kept only for completeness of
    /// the XTS wrapper — this crate never writes to a device.
    pub fn encrypt_block(&self, block_number: u64, data: &mut [u8; 4096]) {
        let tweak = get_tweak_default(block_number as u128);
        self.xts.encrypt_sector(data, tweak);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let vek = [0x42u8; 32];
        let ctx = XtsContext::new(&vek);
        let mut block = [0u8; 4096];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let original = block;
        ctx.encrypt_block(7, &mut block);
        assert_ne!(block, original);
        ctx.decrypt_block(7, &mut block);
        assert_eq!(block, original);
    }

    #[test]
    fn test_tweak_changes_ciphertext() {
        let vek = [0x11u8; 32];
        let ctx = XtsContext::new(&vek);
        let mut a = [0x5au8; 4096];
        let mut b = [0x5au8; 4096];
        ctx.encrypt_block(1, &mut a);
        ctx.encrypt_block(2, &mut b);
        assert_ne!(a, b);
    }
}
