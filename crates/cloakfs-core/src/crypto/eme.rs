//! EME wide-block encryption (Halevi-Rogaway 2003) over AES-256.
//!
//! EME turns AES into a tweakable cipher over 1..=128 consecutive 16-byte
//! blocks: flipping any plaintext bit randomizes the whole ciphertext and
//! vice versa. Filenames are encrypted this way, with the per-directory IV
//! as the tweak, so that equal names in different directories produce
//! unrelated ciphertext names.

use std::sync::RwLock;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use tracing::trace;

use crate::crypto::CryptoError;

/// AES block size; EME inputs must be a non-empty multiple of this.
pub const EME_BLOCK_SIZE: usize = 16;

/// EME is specified for at most 128 block-cipher blocks (2048 bytes).
const EME_MAX_BLOCKS: usize = 128;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// A wide-block cipher instance keyed with the filename subkey.
///
/// The inner AES key schedule is dropped on [`wipe`](EmeCipher::wipe);
/// every operation afterwards fails with [`CryptoError::Wiped`].
pub struct EmeCipher {
    cipher: RwLock<Option<Aes256>>,
}

impl EmeCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key));
        EmeCipher {
            cipher: RwLock::new(Some(cipher)),
        }
    }

    /// Encrypt `plaintext` under `tweak`. Output length equals input length.
    pub fn encrypt(&self, tweak: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.transform(tweak, plaintext, Direction::Encrypt)
    }

    /// Decrypt `ciphertext` under `tweak`. Output length equals input length.
    pub fn decrypt(&self, tweak: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.transform(tweak, ciphertext, Direction::Decrypt)
    }

    /// Drop the AES key schedule. Later calls fail deterministically.
    pub fn wipe(&self) {
        let mut guard = self.cipher.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        trace!("EME cipher wiped");
    }

    fn transform(
        &self,
        tweak: &[u8; 16],
        input: &[u8],
        direction: Direction,
    ) -> Result<Vec<u8>, CryptoError> {
        if input.is_empty() || input.len() % EME_BLOCK_SIZE != 0 {
            return Err(CryptoError::InvalidInput(
                "EME input must be a non-empty multiple of 16 bytes",
            ));
        }
        let m = input.len() / EME_BLOCK_SIZE;
        if m > EME_MAX_BLOCKS {
            return Err(CryptoError::InvalidInput(
                "EME operates on at most 128 blocks",
            ));
        }

        let guard = self.cipher.read().map_err(|_| CryptoError::Wiped)?;
        let bc = guard.as_ref().ok_or(CryptoError::Wiped)?;

        // L table: L_j = 2^(j+1) * AES-enc(K, 0^16). Always uses the encrypt
        // direction, even when decrypting.
        let mut l_table = Vec::with_capacity(m);
        let mut li = [0u8; 16];
        {
            let mut zero = Block::default();
            bc.encrypt_block(&mut zero);
            li.copy_from_slice(&zero);
        }
        for _ in 0..m {
            li = mult_by_two(&li);
            l_table.push(li);
        }

        let mut c = vec![0u8; input.len()];

        // PPP_j = AES(K; P_j xor L_j)
        for j in 0..m {
            let mut block = Block::clone_from_slice(&input[j * 16..(j + 1) * 16]);
            xor_in_place(&mut block, &l_table[j]);
            aes_transform(bc, direction, &mut block);
            c[j * 16..(j + 1) * 16].copy_from_slice(&block);
        }

        // MP = PPP_1 xor ... xor PPP_m xor T
        let mut mp = [0u8; 16];
        for (i, b) in mp.iter_mut().enumerate() {
            *b = c[i] ^ tweak[i];
        }
        for j in 1..m {
            for i in 0..16 {
                mp[i] ^= c[j * 16 + i];
            }
        }

        // MC = AES(K; MP), M = MP xor MC
        let mut mc = Block::clone_from_slice(&mp);
        aes_transform(bc, direction, &mut mc);
        let mut m_mask = [0u8; 16];
        for i in 0..16 {
            m_mask[i] = mp[i] ^ mc[i];
        }

        // CCC_j = PPP_j xor 2^(j-1)*M for j >= 2
        for j in 1..m {
            m_mask = mult_by_two(&m_mask);
            for i in 0..16 {
                c[j * 16 + i] ^= m_mask[i];
            }
        }

        // CCC_1 = MC xor CCC_2 xor ... xor CCC_m xor T
        let mut ccc1 = [0u8; 16];
        for i in 0..16 {
            ccc1[i] = mc[i] ^ tweak[i];
        }
        for j in 1..m {
            for i in 0..16 {
                ccc1[i] ^= c[j * 16 + i];
            }
        }
        c[0..16].copy_from_slice(&ccc1);

        // C_j = AES(K; CCC_j) xor L_j
        for j in 0..m {
            let mut block = Block::clone_from_slice(&c[j * 16..(j + 1) * 16]);
            aes_transform(bc, direction, &mut block);
            xor_in_place(&mut block, &l_table[j]);
            c[j * 16..(j + 1) * 16].copy_from_slice(&block);
        }

        Ok(c)
    }
}

impl std::fmt::Debug for EmeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let wiped = self
            .cipher
            .read()
            .map(|g| g.is_none())
            .unwrap_or(true);
        f.debug_struct("EmeCipher").field("wiped", &wiped).finish()
    }
}

fn aes_transform(bc: &Aes256, direction: Direction, block: &mut Block) {
    match direction {
        Direction::Encrypt => bc.encrypt_block(block),
        Direction::Decrypt => bc.decrypt_block(block),
    }
}

fn xor_in_place(block: &mut Block, other: &[u8; 16]) {
    for i in 0..16 {
        block[i] ^= other[i];
    }
}

/// Multiplication by 2 in GF(2^128) with the EME bit ordering.
fn mult_by_two(input: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0] = input[0] << 1;
    if input[15] >= 128 {
        out[0] ^= 135;
    }
    for j in 1..16 {
        out[j] = input[j] << 1;
        if input[j - 1] >= 128 {
            out[j] += 1;
        }
    }
    out
}
