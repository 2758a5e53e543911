//! IPC message representation.

use alloc::vec::Vec;

use crate::{
    config::MESSAGE_MAX,
    error::{KernelError, KernelResult},
};

/// One queued message: a type tag plus an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    tag: u32,
    data: Vec<u8>,
}

impl Message {
    /// Build a message, rejecting payloads above [`MESSAGE_MAX`].
    pub fn new(tag: u32, data: Vec<u8>) -> KernelResult<Self> {
        if data.len() > MESSAGE_MAX {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self { tag, data })
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn payload_at_limit_is_accepted() {
        let msg = Message::new(7, vec![0u8; MESSAGE_MAX]).expect("payload at MESSAGE_MAX");
        assert_eq!(msg.tag(), 7);
        assert_eq!(msg.len(), MESSAGE_MAX);
    }

    #[test]
    fn payload_over_limit_is_invalid() {
        assert_eq!(
            Message::new(7, vec![0u8; MESSAGE_MAX + 1]).unwrap_err(),
            KernelError::InvalidArgument
        );
    }
}
