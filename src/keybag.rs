//! Container and volume key bags, and the password/recovery-password
//! unwrap pipeline that turns a credential into a volume encryption key.

use aes_kw::Kek;
use byteorder::{BigEndian, ReadBytesExt};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::Sha256;
use std::io::Cursor;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::block::BlockDevice;
use crate::crypto::XtsContext;
use crate::error::{ApfsError, Result};

/// Entry tag identifying what a keybag entry's key data represents.
pub const KB_TAG_VOLUME_KEY: u16 = 0x0805;
pub const KB_TAG_VOLUME_UNLOCK_RECORDS: u16 = 0x0802;

const KB_LOCKER_SIGNATURE: u32 = 0x4B53_4B42; // "KSKB" read as a big-endian u32 tag

/// A secret byte buffer that zeroizes its backing memory on drop, and is
/// never reachable from a `Debug` impl or a trace-sink message.
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        SecretBytes(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBytes(..)")
    }
}

/// One `keybag_entry_t` record: a UUID-tagged, tag-typed blob of key
/// material (itself wrapped, except for the raw per-volume KEK entry).
#[derive(Debug, Clone)]
pub struct KeybagEntry {
    pub uuid: Uuid,
    pub tag: u16,
    pub key_data: Vec<u8>,
}

/// A parsed `kb_locker_t`: the decrypted keybag payload for either the
/// container's media keybag or a single volume's nested keybag.
pub struct Keybag {
    pub entries: Vec<KeybagEntry>,
}

impl Keybag {
    /// Parse a decrypted keybag payload. Layout: 4-byte signature, 2-byte
    /// version, 2-byte num_keys, 4-byte keybag_size, then `num_keys` ×
    /// `keybag_entry_t { uuid: [u8;16], tag: u16, key_len: u16,
    /// padding: [u8;4], key_data: [u8; key_len rounded up to 16] }`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(ApfsError::Malformed("keybag locker too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let signature = cursor.read_u32::<BigEndian>()?;
        if signature != KB_LOCKER_SIGNATURE {
            return Err(ApfsError::Malformed(format!("bad keybag signature: 0x{signature:08X}")));
        }
        let _version = cursor.read_u16::<BigEndian>()?;
        let num_keys = cursor.read_u16::<BigEndian>()?;
        let _keybag_size = cursor.read_u32::<BigEndian>()?;

        let mut entries = Vec::with_capacity(num_keys as usize);
        let mut offset = 12usize;

        for _ in 0..num_keys {
            if offset + 24 > data.len() {
                return Err(ApfsError::Malformed("keybag entry header out of bounds".into()));
            }
            let uuid = Uuid::from_slice(&data[offset..offset + 16])
                .map_err(|e| ApfsError::Malformed(format!("invalid keybag entry uuid: {e}")))?;
            let tag = u16::from_be_bytes([data[offset + 16], data[offset + 17]]);
            let key_len = u16::from_be_bytes([data[offset + 18], data[offset + 19]]) as usize;
            // 4 bytes of padding follow key_len, then the key data itself.
            let key_start = offset + 24;
            let padded_len = (key_len + 15) & !15;
            let key_end = key_start
                .checked_add(padded_len)
                .ok_or_else(|| ApfsError::Malformed("keybag entry key length overflow".into()))?;
            if key_end > data.len() {
                return Err(ApfsError::Malformed("keybag entry key data out of bounds".into()));
            }

            entries.push(KeybagEntry { uuid, tag, key_data: data[key_start..key_start + key_len].to_vec() });
            offset = key_end;
        }

        Ok(Keybag { entries })
    }

    pub fn find(&self, uuid: &Uuid, tag: u16) -> Option<&KeybagEntry> {
        self.entries.iter().find(|e| &e.uuid == uuid && e.tag == tag)
    }
}

/// Read and decrypt a keybag's on-disk blocks. The keybag is itself
/// AES-XTS encrypted with the container UUID serving as the VEK analogue,
/// tweaked by the block's offset from the keybag's first block.
pub fn read_keybag(
    device: &dyn BlockDevice,
    block_size: u32,
    start_paddr: u64,
    block_count: u32,
    container_uuid: &Uuid,
) -> Result<Keybag> {
    let vek: [u8; 16] = *container_uuid.as_bytes();
    let mut vek32 = [0u8; 32];
    vek32[0..16].copy_from_slice(&vek);
    vek32[16..32].copy_from_slice(&vek);
    let ctx = XtsContext::new(&vek32);

    let mut payload = Vec::with_capacity(block_size as usize * block_count as usize);
    for i in 0..block_count as u64 {
        let mut block = vec![0u8; block_size as usize];
        device.read_exact_at((start_paddr + i) * block_size as u64, &mut block)?;
        if block_size == 4096 {
            let mut fixed: [u8; 4096] = block.as_slice().try_into().unwrap();
            ctx.decrypt_block(i, &mut fixed);
            block = fixed.to_vec();
        }
        payload.extend_from_slice(&block);
    }

    Keybag::parse(&payload)
}

/// Unwrap a password- or recovery-password-protected volume encryption
/// key. `wrapped_kek` is the per-volume unlock record's wrapped KEK;
/// `wrapped_vek` is the `KB_TAG_VOLUME_KEY` entry's wrapped key. Both
/// unwraps use RFC 3394 AES key-wrap; failure of either unwrap's built-in
/// integrity check surfaces as `BadCredential`.
pub fn unwrap_password(
    password: &[u8],
    salt: &[u8; 16],
    iterations: u32,
    wrapped_kek: &[u8],
    wrapped_vek: &[u8],
) -> Result<SecretBytes> {
    let mut password_kek = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut password_kek)
        .map_err(|_| ApfsError::BadCredential)?;

    let kek = unwrap_key(&password_kek, wrapped_kek)?;
    let vek = unwrap_key(&kek, wrapped_vek)?;

    Ok(SecretBytes::new(vek))
}

fn unwrap_key(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    if kek.len() != 32 {
        return Err(ApfsError::Malformed("key-encrypting key must be 32 bytes".into()));
    }
    let kek_array: [u8; 32] = kek.try_into().unwrap();
    let unwrapper = Kek::from(kek_array);

    if wrapped.len() < 16 || wrapped.len() % 8 != 0 {
        return Err(ApfsError::Malformed("wrapped key has invalid length".into()));
    }
    let mut out = vec![0u8; wrapped.len() - 8];
    unwrapper.unwrap(wrapped, &mut out).map_err(|_| ApfsError::BadCredential)?;
    Ok(out)
}

/// Location of a per-volume keybag: a physical block run, carried inside
/// the container keybag's `KB_TAG_VOLUME_UNLOCK_RECORDS` entry for a given
/// volume UUID.
pub struct VolumeKeybagLocation {
    pub start_paddr: u64,
    pub block_count: u64,
}

fn parse_volume_keybag_location(key_data: &[u8]) -> Result<VolumeKeybagLocation> {
    if key_data.len() < 16 {
        return Err(ApfsError::Malformed("volume unlock-records entry too short".into()));
    }
    Ok(VolumeKeybagLocation {
        start_paddr: u64::from_le_bytes(key_data[0..8].try_into().unwrap()),
        block_count: u64::from_le_bytes(key_data[8..16].try_into().unwrap()),
    })
}

/// Which credential a volume was presented.
#[derive(Debug, Clone, Copy)]
pub enum CredentialKind {
    Password,
    RecoveryPassword,
}

/// Tag of the per-volume keybag entry holding a password-derived wrapped
/// KEK; recovery passwords are wrapped under a distinct tag in the same
/// entry table.
const KB_TAG_PASSWORD_KEK: u16 = 0x0101;
const KB_TAG_RECOVERY_KEK: u16 = 0x0102;

/// UUID marking the passphrase-wrapped-KEK entry inside a per-volume
/// keybag, constant across every volume (the entry's own UUID field is not
/// the volume's UUID — that's only used to index the container keybag).
fn passphrase_wrapped_kek_uuid() -> Uuid {
    Uuid::parse_str("ebc6c064-0000-11aa-aa11-00306543ecac").expect("valid constant UUID")
}

/// Run the full password/recovery-password unlock pipeline for one volume:
/// find its wrapped VEK and per-volume keybag location in the container
/// keybag, read that per-volume keybag, then unwrap KEK and VEK in turn.
/// Returns `BadCredential` if the supplied secret doesn't unwrap cleanly.
pub fn unlock_vek(
    device: &dyn BlockDevice,
    block_size: u32,
    container_keybag: &Keybag,
    container_uuid: &Uuid,
    volume_uuid: &Uuid,
    credential: &[u8],
    kind: CredentialKind,
) -> Result<SecretBytes> {
    let vek_entry = container_keybag
        .find(volume_uuid, KB_TAG_VOLUME_KEY)
        .ok_or_else(|| ApfsError::NotFound(format!("no volume key entry for {volume_uuid}")))?;
    let unlock_entry = container_keybag
        .find(volume_uuid, KB_TAG_VOLUME_UNLOCK_RECORDS)
        .ok_or_else(|| ApfsError::NotFound(format!("no unlock-records entry for {volume_uuid}")))?;
    let location = parse_volume_keybag_location(&unlock_entry.key_data)?;

    let volume_keybag = read_keybag(device, block_size, location.start_paddr, location.block_count as u32, container_uuid)?;

    let tag = match kind {
        CredentialKind::Password => KB_TAG_PASSWORD_KEK,
        CredentialKind::RecoveryPassword => KB_TAG_RECOVERY_KEK,
    };
    let kek_entry = volume_keybag
        .find(&passphrase_wrapped_kek_uuid(), tag)
        .ok_or(ApfsError::Locked)?;

    if kek_entry.key_data.len() < 20 {
        return Err(ApfsError::Malformed("passphrase-wrapped KEK entry too short".into()));
    }
    let salt: [u8; 16] = kek_entry.key_data[0..16].try_into().unwrap();
    let iterations = u32::from_le_bytes(kek_entry.key_data[16..20].try_into().unwrap());
    let wrapped_kek = &kek_entry.key_data[20..];

    unwrap_password(credential, &salt, iterations, wrapped_kek, &vek_entry.key_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_locker(entries: &[(Uuid, u16, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&KB_LOCKER_SIGNATURE.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes()); // version
        data.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes()); // keybag_size, unused by the parser

        for (uuid, tag, key) in entries {
            data.extend_from_slice(uuid.as_bytes());
            data.extend_from_slice(&tag.to_be_bytes());
            data.extend_from_slice(&(key.len() as u16).to_be_bytes());
            data.extend_from_slice(&[0u8; 4]);
            data.extend_from_slice(key);
            let pad = (16 - key.len() % 16) % 16;
            data.extend_from_slice(&vec![0u8; pad]);
        }
        data
    }

    #[test]
    fn test_parse_keybag_single_entry() {
        let uuid = Uuid::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888);
        let key = [0xABu8; 40];
        let data = sample_locker(&[(uuid, KB_TAG_VOLUME_KEY, &key)]);

        let keybag = Keybag::parse(&data).unwrap();
        assert_eq!(keybag.entries.len(), 1);
        let entry = keybag.find(&uuid, KB_TAG_VOLUME_KEY).unwrap();
        assert_eq!(entry.key_data, key.to_vec());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut data = vec![0u8; 16];
        data[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        assert!(Keybag::parse(&data).is_err());
    }

    #[test]
    fn test_unwrap_password_roundtrip() {
        let password_kek = [0x11u8; 32];
        let kek = [0x22u8; 32];
        let vek = [0x33u8; 32];

        let wrapper = Kek::from(password_kek);
        let mut wrapped_kek = vec![0u8; kek.len() + 8];
        wrapper.wrap(&kek, &mut wrapped_kek).unwrap();

        let wrapper2 = Kek::from(kek);
        let mut wrapped_vek = vec![0u8; vek.len() + 8];
        wrapper2.wrap(&vek, &mut wrapped_vek).unwrap();

        let unwrapped_kek = unwrap_key(&password_kek, &wrapped_kek).unwrap();
        assert_eq!(unwrapped_kek, kek.to_vec());

        let unwrapped_vek = unwrap_key(&kek, &wrapped_vek).unwrap();
        assert_eq!(unwrapped_vek, vek.to_vec());
    }

    #[test]
    fn test_unwrap_bad_credential_on_corrupt_wrapped_data() {
        let kek = [0x22u8; 32];
        let mut wrapped = vec![0u8; 48];
        wrapped[0] = 0xFF;
        assert!(unwrap_key(&kek, &wrapped).is_err());
    }
}
