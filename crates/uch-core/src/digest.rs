use crate::error::Failure;

/// 128-bit digest over a byte buffer. The UserChoice algorithm needs MD5
/// exactly as the OS computes it; strength is irrelevant.
pub trait Digest128 {
    fn digest128(&self, bytes: &[u8]) -> Result<[u8; 16], Failure>;
}

/// Portable MD5 from the `md5` crate. Never fails.
#[derive(Debug, Default, Copy, Clone)]
pub struct Md5Digest;

impl Digest128 for Md5Digest {
    fn digest128(&self, bytes: &[u8]) -> Result<[u8; 16], Failure> {
        Ok(md5::compute(bytes).0)
    }
}

/// MD5 through the Windows CNG provider, the same one the shell uses.
#[cfg(windows)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CngMd5Digest;

#[cfg(windows)]
impl Digest128 for CngMd5Digest {
    fn digest128(&self, bytes: &[u8]) -> Result<[u8; 16], Failure> {
        use windows::core::PCWSTR;
        use windows::Win32::Security::Cryptography::{
            BCryptCloseAlgorithmProvider, BCryptCreateHash, BCryptDestroyHash, BCryptFinishHash,
            BCryptHashData, BCryptOpenAlgorithmProvider, BCRYPT_ALG_HANDLE, BCRYPT_HASH_HANDLE,
            BCRYPT_MD5_ALGORITHM, BCRYPT_OPEN_ALGORITHM_PROVIDER_FLAGS,
        };

        let mut out = [0u8; 16];
        unsafe {
            let mut alg = BCRYPT_ALG_HANDLE::default();
            let status = BCryptOpenAlgorithmProvider(
                &mut alg,
                BCRYPT_MD5_ALGORITHM,
                PCWSTR::null(),
                BCRYPT_OPEN_ALGORITHM_PROVIDER_FLAGS(0),
            );
            if status.is_err() {
                return Err(Failure::DigestUnavailable(format!(
                    "BCryptOpenAlgorithmProvider failed with {:#x}",
                    status.0
                )));
            }

            // The hash handle owns its object buffer when none is supplied.
            let mut hash = BCRYPT_HASH_HANDLE::default();
            let mut result = BCryptCreateHash(alg, &mut hash, None, None, 0)
                .ok()
                .map_err(|e| format!("BCryptCreateHash: {}", e));
            if result.is_ok() {
                result = BCryptHashData(hash, bytes, 0)
                    .ok()
                    .and_then(|()| BCryptFinishHash(hash, &mut out, 0).ok())
                    .map_err(|e| format!("BCryptHashData/FinishHash: {}", e));
                let _ = BCryptDestroyHash(hash);
            }
            let _ = BCryptCloseAlgorithmProvider(alg, 0);

            result.map_err(Failure::DigestUnavailable)?;
        }
        Ok(out)
    }
}
