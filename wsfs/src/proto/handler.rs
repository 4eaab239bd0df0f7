use super::codec::PacketReader;
use super::errors::ProtoResult;
use super::procedures;
use super::protocol::Opcode;
use crate::fs::Wsfs;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes one request frame to its procedure. Cloned per connection; all
/// clones share the engine.
#[derive(Clone)]
pub struct Dispatcher {
    filesystem: Arc<Wsfs>,
    /// Largest reply the transport will carry.
    max_reply_size: usize,
}

impl Dispatcher {
    pub fn new(filesystem: Arc<Wsfs>, max_reply_size: usize) -> Self {
        Self {
            filesystem,
            max_reply_size,
        }
    }

    /// Returns the reply to send, `None` when the frame needs no reply, or
    /// an error when the frame cannot be decoded.
    pub async fn handle_message(&self, frame: Bytes) -> ProtoResult<Option<Bytes>> {
        let mut request = PacketReader::new(frame);
        let raw_opcode = request.u8()?;

        let opcode = match Opcode::try_from(raw_opcode) {
            Ok(Opcode::Internal) => {
                debug!("Ignoring internal control message");
                return Ok(None);
            }
            Ok(opcode) => opcode,
            Err(unknown) => {
                warn!("Dropping request with unknown opcode {}", unknown);
                return Ok(None);
            }
        };

        let fs = self.filesystem.as_ref();
        let request = &mut request;
        let reply = match opcode {
            Opcode::Internal => return Ok(None),
            Opcode::Init => procedures::init(fs, request).await,
            Opcode::Destroy => procedures::destroy(fs, request).await,
            Opcode::Lookup => procedures::lookup(fs, request).await,
            Opcode::Forget => procedures::forget(fs, request).await,
            Opcode::BatchForget => procedures::batch_forget(fs, request).await,
            Opcode::Getattr => procedures::getattr(fs, request).await,
            Opcode::Setattr => procedures::setattr(fs, request).await,
            Opcode::Readlink => procedures::readlink(fs, request).await,
            Opcode::Mknod => procedures::mknod(fs, request).await,
            Opcode::Mkdir => procedures::mkdir(fs, request).await,
            Opcode::Unlink => procedures::unlink(fs, request).await,
            Opcode::Rmdir => procedures::rmdir(fs, request).await,
            Opcode::Symlink => procedures::symlink(fs, request).await,
            Opcode::Rename => procedures::rename(fs, request).await,
            Opcode::Link => procedures::link(fs, request).await,
            Opcode::Open => procedures::open(fs, request).await,
            Opcode::Read => procedures::read(fs, request).await,
            Opcode::Write => procedures::write(fs, request).await,
            Opcode::Flush => procedures::flush(fs, request).await,
            Opcode::Release => procedures::release(fs, request).await,
            Opcode::Fsync | Opcode::Fsyncdir => procedures::fsync(fs, request).await,
            Opcode::Opendir => procedures::opendir(fs, request).await,
            Opcode::Readdir => procedures::readdir(fs, request, self.max_reply_size).await,
            Opcode::Readdirplus => {
                procedures::readdirplus(fs, request, self.max_reply_size).await
            }
            Opcode::Releasedir => procedures::releasedir(fs, request).await,
            Opcode::Statfs => procedures::statfs(fs, request).await,
            Opcode::Setxattr => procedures::setxattr(fs, request).await,
            Opcode::Getxattr => procedures::getxattr(fs, request).await,
            Opcode::Listxattr => procedures::listxattr(fs, request).await,
            Opcode::Removexattr => procedures::removexattr(fs, request).await,
            Opcode::Access => procedures::access(fs, request).await,
            Opcode::Create => procedures::create(fs, request).await,
        }?;

        Ok(Some(reply))
    }
}
