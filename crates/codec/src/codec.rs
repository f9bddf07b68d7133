//! Frame sealing and opening.

use crate::error::{ErrorKind, Result};
use crate::keys::Keys;
use crate::payload::{Payload, PayloadEncoder, inflate};
use crate::{ALIGNMENT, FRAME_OVERHEAD, Geometry};
use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use exn::ResultExt;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use tracing::instrument;

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;
type HmacSha1 = Hmac<Sha1>;

const TAG_LEN: usize = 20;
const HEADER_LEN: usize = 8;

/// Seals payload chunks into fixed-size encrypted blocks and opens them again.
///
/// # Examples
///
/// ```
/// use cumulus_codec::{BlockCodec, Geometry, Keys};
///
/// let codec = BlockCodec::new(Keys::generate(), Geometry::new(8192, 1024).unwrap());
/// let blocks = codec.encode(b"hello world").unwrap();
/// assert_eq!(blocks.len(), 1);
/// assert_eq!(blocks[0].len() % 4096, 0);
/// assert_eq!(codec.decode_parts(&blocks).unwrap(), b"hello world");
/// ```
#[derive(Debug, Clone)]
pub struct BlockCodec {
    keys: Keys,
    geometry: Geometry,
}

impl BlockCodec {
    pub fn new(keys: Keys, geometry: Geometry) -> Self {
        Self { keys, geometry }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Start compressing a new payload. A `shareable` payload may end up
    /// packed into a shared block if it stays within the small-file limit.
    pub fn encoder(&self, shareable: bool) -> PayloadEncoder {
        PayloadEncoder::new(self.geometry, shareable)
    }

    /// Compress and seal an in-memory payload into its own blocks (never
    /// shared), in part order.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut encoder = self.encoder(false);
        let mut chunks = encoder.write(data)?;
        match encoder.finish()? {
            Payload::Chunks(rest) => chunks.extend(rest),
            Payload::Shared(small) => chunks.push(small),
        }
        chunks.iter().map(|chunk| self.seal(chunk)).collect()
    }

    /// Frame, pad and double-encrypt one payload chunk.
    #[instrument(skip(self, payload), fields(payload_size = payload.len(), block_size))]
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.geometry.chunk_size() {
            exn::bail!(ErrorKind::Encoder);
        }
        let length = u32::try_from(payload.len()).or_raise(|| ErrorKind::Encoder)?;
        let mut rng = rand::thread_rng();
        let mut frame = Vec::with_capacity(self.geometry.block_size());
        frame.extend_from_slice(&rng.next_u32().to_ne_bytes());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&self.tag(payload)?);
        frame.extend_from_slice(&rng.next_u32().to_ne_bytes());

        let mut padded = frame.len().max(self.geometry.small_file_limit());
        padded = padded.div_ceil(ALIGNMENT) * ALIGNMENT;
        let start = frame.len();
        frame.resize(padded, 0);
        rng.fill_bytes(&mut frame[start..]);

        Self::encrypt(&self.keys.key1, &self.keys.iv1, &mut frame)?;
        frame.rotate_right(1);
        Self::encrypt(&self.keys.key2, &self.keys.iv2, &mut frame)?;
        tracing::Span::current().record("block_size", frame.len());
        Ok(frame)
    }

    /// Decrypt and authenticate one block, returning the raw payload chunk.
    #[instrument(skip(self, block), fields(block_size = block.len()))]
    pub fn open(&self, block: &[u8]) -> Result<Vec<u8>> {
        if block.is_empty() || block.len() % ALIGNMENT != 0 {
            exn::bail!(ErrorKind::Corrupt(format!("block length {} is not a multiple of {ALIGNMENT}", block.len())));
        }
        let mut frame = block.to_vec();
        Self::decrypt(&self.keys.key2, &self.keys.iv2, &mut frame)?;
        frame.rotate_left(1);
        Self::decrypt(&self.keys.key1, &self.keys.iv1, &mut frame)?;

        let mut length = [0u8; 4];
        length.copy_from_slice(&frame[4..HEADER_LEN]);
        let length = u32::from_be_bytes(length) as usize;
        if length > frame.len() - FRAME_OVERHEAD {
            exn::bail!(ErrorKind::Corrupt(format!("declared payload length {length} exceeds frame capacity")));
        }
        let payload = &frame[HEADER_LEN..HEADER_LEN + length];
        let tag = &frame[HEADER_LEN + length..HEADER_LEN + length + TAG_LEN];
        let mut mac = self.mac()?;
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| exn::Exn::from(ErrorKind::Corrupt("HMAC mismatch".into())))?;
        Ok(payload.to_vec())
    }

    /// Open a single-part block. Shared block bodies are returned as-is,
    /// everything else is decompressed.
    pub fn decode(&self, block: &[u8], shared: bool) -> Result<Vec<u8>> {
        let payload = self.open(block)?;
        match shared {
            true => Ok(payload),
            false => inflate(&payload),
        }
    }

    /// Open every part of a logical block, in part order, and decompress the
    /// joined payload.
    pub fn decode_parts<B: AsRef<[u8]>>(&self, parts: &[B]) -> Result<Vec<u8>> {
        let mut compressed = Vec::new();
        for part in parts {
            compressed.extend(self.open(part.as_ref())?);
        }
        inflate(&compressed)
    }

    fn mac(&self) -> Result<HmacSha1> {
        <HmacSha1 as Mac>::new_from_slice(&self.keys.sign)
            .map_err(|_| exn::Exn::from(ErrorKind::InvalidKey("sign".into())))
    }

    fn tag(&self, payload: &[u8]) -> Result<[u8; TAG_LEN]> {
        let mut mac = self.mac()?;
        mac.update(payload);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }

    fn encrypt(key: &[u8], iv: &[u8], buffer: &mut [u8]) -> Result<()> {
        let len = buffer.len();
        Encryptor::new_from_slices(key, iv)
            .map_err(|_| exn::Exn::from(ErrorKind::InvalidKey("cipher key".into())))?
            .encrypt_padded_mut::<NoPadding>(buffer, len)
            .map_err(|_| exn::Exn::from(ErrorKind::Encoder))?;
        Ok(())
    }

    fn decrypt(key: &[u8], iv: &[u8], buffer: &mut [u8]) -> Result<()> {
        Decryptor::new_from_slices(key, iv)
            .map_err(|_| exn::Exn::from(ErrorKind::InvalidKey("cipher key".into())))?
            .decrypt_padded_mut::<NoPadding>(buffer)
            .map_err(|_| exn::Exn::from(ErrorKind::Corrupt("cipher rejected block".into())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const BLOCK_SIZE: usize = 8192;

    fn codec() -> BlockCodec {
        BlockCodec::new(Keys::generate(), Geometry::new(BLOCK_SIZE, 1024).unwrap())
    }

    fn random(len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(BLOCK_SIZE - 33)]
    #[case(BLOCK_SIZE - 32)]
    #[case(BLOCK_SIZE - 31)]
    #[case(2 * BLOCK_SIZE + 1)]
    fn test_round_trip(#[case] len: usize) {
        let codec = codec();
        let data = random(len);
        let blocks = codec.encode(&data).unwrap();
        assert!(blocks.iter().all(|block| block.len() % ALIGNMENT == 0 && block.len() <= BLOCK_SIZE));
        assert_eq!(codec.decode_parts(&blocks).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_spans_parts() {
        let codec = codec();
        let blocks = codec.encode(&random(2 * BLOCK_SIZE + 1)).unwrap();
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn test_small_frames_pad_to_small_file_limit() {
        let codec = BlockCodec::new(Keys::generate(), Geometry::new(16384, 6000).unwrap());
        assert_eq!(codec.seal(b"x").unwrap().len(), 8192);
        assert_eq!(codec.seal(&[0; 9000]).unwrap().len(), 12288);
    }

    #[test]
    fn test_sealing_is_randomised() {
        let codec = codec();
        let a = codec.seal(b"same payload").unwrap();
        let b = codec.seal(b"same payload").unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.open(&a).unwrap(), codec.open(&b).unwrap());
    }

    #[test]
    fn test_shared_decode_returns_raw_payload() {
        let codec = codec();
        let block = codec.seal(b"raw shared body").unwrap();
        assert_eq!(codec.decode(&block, true).unwrap(), b"raw shared body");
        assert!(codec.decode(&block, false).is_err());
    }

    #[test]
    fn test_oversized_payload_is_refused() {
        let err = codec().seal(&[0; BLOCK_SIZE - 31]).unwrap_err();
        assert_eq!(*err, ErrorKind::Encoder);
    }

    #[rstest]
    #[case(0)]
    #[case(100)]
    #[case(4095)]
    fn test_rejects_misaligned_blocks(#[case] len: usize) {
        let err = codec().open(&vec![0; len]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }

    #[test]
    fn test_detects_tampering() {
        let codec = codec();
        let mut block = codec.seal(b"important bytes").unwrap();
        // Early bytes reach the header and payload through the rotation.
        block[5] ^= 0x01;
        let err = codec.open(&block).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }

    #[test]
    fn test_wrong_keys_are_corruption() {
        let geometry = Geometry::new(BLOCK_SIZE, 1024).unwrap();
        let block = BlockCodec::new(Keys::generate(), geometry).seal(b"secret").unwrap();
        let err = BlockCodec::new(Keys::generate(), geometry).open(&block).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Corrupt(_)));
    }
}
