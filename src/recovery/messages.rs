//! Recovery wire messages
//!
//! Every message is a plain record with explicit `write_to` / `read_from`.
//! Source-to-target requests travel inside a [`RecoveryRequest`] envelope and
//! are answered by a [`RecoveryResponse`]; both are one tag byte followed by
//! the body. Decoding requires the body to consume the buffer exactly.
//!
//! Requests sent by the source handler start with `request_seq_no`, which is
//! monotonic per session.

use crate::shard::{NodeId, ShardId};
use crate::store::FileMetadata;
use crate::stream::{CodecError, CodecResult, StreamInput, StreamOutput};
use crate::translog::{TranslogOperation, MIN_OPERATION_BYTES};

use super::errors::{RecoveryError, RecoveryErrorKind};

/// string (1) + vlong (1) + i32 (4)
const MIN_FILE_METADATA_BYTES: usize = 6;

fn write_total_ops(out: &mut StreamOutput, total: u32) {
    out.write_vlong(u64::from(total));
}

fn read_total_ops(input: &mut StreamInput<'_>) -> CodecResult<u32> {
    let raw = input.read_vint()?;
    if raw < 0 {
        return Err(CodecError::NegativeLength {
            value: i64::from(raw),
        });
    }
    Ok(raw as u32)
}

/// Target → source: ask for a recovery of `shard_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRecoveryRequest {
    pub recovery_id: i64,
    pub shard_id: ShardId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    /// Files the target already holds.
    pub metadata_snapshot: Vec<FileMetadata>,
    /// First sequence number the target is missing.
    pub starting_seq_no: i64,
}

impl StartRecoveryRequest {
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.recovery_id);
        self.shard_id.write_to(out);
        self.source_node.write_to(out);
        self.target_node.write_to(out);
        out.write_len(self.metadata_snapshot.len());
        for file in &self.metadata_snapshot {
            file.write_to(out);
        }
        out.write_i64(self.starting_seq_no);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        Ok(Self {
            recovery_id: input.read_i64()?,
            shard_id: ShardId::read_from(input)?,
            source_node: NodeId::read_from(input)?,
            target_node: NodeId::read_from(input)?,
            metadata_snapshot: input.read_list(
                "metadata snapshot",
                MIN_FILE_METADATA_BYTES,
                FileMetadata::read_from,
            )?,
            starting_seq_no: input.read_i64()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = StreamOutput::new();
        self.write_to(&mut out);
        out.into_bytes()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut input = StreamInput::new(data);
        let request = Self::read_from(&mut input)?;
        input.finish()?;
        Ok(request)
    }
}

/// File inventory: what will be sent and what the target already has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesInfoRequest {
    pub request_seq_no: i64,
    pub recovery_id: i64,
    pub shard_id: ShardId,
    pub phase1_file_names: Vec<String>,
    pub phase1_file_sizes: Vec<u64>,
    pub phase1_existing_file_names: Vec<String>,
    pub phase1_existing_file_sizes: Vec<u64>,
    pub total_translog_ops: u32,
}

impl FilesInfoRequest {
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.request_seq_no);
        out.write_i64(self.recovery_id);
        self.shard_id.write_to(out);
        out.write_string_list(&self.phase1_file_names);
        out.write_vlong_list(&self.phase1_file_sizes);
        out.write_string_list(&self.phase1_existing_file_names);
        out.write_vlong_list(&self.phase1_existing_file_sizes);
        write_total_ops(out, self.total_translog_ops);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        Ok(Self {
            request_seq_no: input.read_i64()?,
            recovery_id: input.read_i64()?,
            shard_id: ShardId::read_from(input)?,
            phase1_file_names: input.read_string_list("phase1 file names")?,
            phase1_file_sizes: input.read_vlong_list("phase1 file sizes")?,
            phase1_existing_file_names: input.read_string_list("phase1 existing file names")?,
            phase1_existing_file_sizes: input.read_vlong_list("phase1 existing file sizes")?,
            total_translog_ops: read_total_ops(input)?,
        })
    }
}

/// One chunk of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunkRequest {
    pub request_seq_no: i64,
    pub recovery_id: i64,
    pub shard_id: ShardId,
    pub metadata: FileMetadata,
    pub position: u64,
    pub content: Vec<u8>,
    pub last_chunk: bool,
    /// CRC32 of `content`.
    pub chunk_checksum: u32,
    pub total_translog_ops: u32,
}

impl FileChunkRequest {
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.request_seq_no);
        out.write_i64(self.recovery_id);
        self.shard_id.write_to(out);
        self.metadata.write_to(out);
        out.write_vlong(self.position);
        out.write_bytes(&self.content);
        out.write_bool(self.last_chunk);
        out.write_i32(self.chunk_checksum as i32);
        write_total_ops(out, self.total_translog_ops);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        Ok(Self {
            request_seq_no: input.read_i64()?,
            recovery_id: input.read_i64()?,
            shard_id: ShardId::read_from(input)?,
            metadata: FileMetadata::read_from(input)?,
            position: input.read_vlong()?,
            content: input.read_bytes()?,
            last_chunk: input.read_bool()?,
            chunk_checksum: input.read_i32()? as u32,
            total_translog_ops: read_total_ops(input)?,
        })
    }
}

/// All files sent; operations start at `start_seq_no`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesCompleteRequest {
    pub request_seq_no: i64,
    pub recovery_id: i64,
    pub shard_id: ShardId,
    pub start_seq_no: i64,
    pub total_translog_ops: u32,
}

impl FilesCompleteRequest {
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.request_seq_no);
        out.write_i64(self.recovery_id);
        self.shard_id.write_to(out);
        out.write_i64(self.start_seq_no);
        write_total_ops(out, self.total_translog_ops);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        Ok(Self {
            request_seq_no: input.read_i64()?,
            recovery_id: input.read_i64()?,
            shard_id: ShardId::read_from(input)?,
            start_seq_no: input.read_i64()?,
            total_translog_ops: read_total_ops(input)?,
        })
    }
}

/// One batch of operations, in increasing sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslogOpsRequest {
    pub request_seq_no: i64,
    pub recovery_id: i64,
    pub shard_id: ShardId,
    pub operations: Vec<TranslogOperation>,
    pub total_translog_ops: u32,
}

impl TranslogOpsRequest {
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.request_seq_no);
        out.write_i64(self.recovery_id);
        self.shard_id.write_to(out);
        out.write_len(self.operations.len());
        for op in &self.operations {
            op.write_to(out);
        }
        write_total_ops(out, self.total_translog_ops);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        Ok(Self {
            request_seq_no: input.read_i64()?,
            recovery_id: input.read_i64()?,
            shard_id: ShardId::read_from(input)?,
            operations: input.read_list(
                "translog operations",
                MIN_OPERATION_BYTES,
                TranslogOperation::read_from,
            )?,
            total_translog_ops: read_total_ops(input)?,
        })
    }
}

/// Promote the received files and declare the target in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeRequest {
    pub request_seq_no: i64,
    pub recovery_id: i64,
    pub shard_id: ShardId,
    pub global_checkpoint: i64,
}

impl FinalizeRequest {
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.request_seq_no);
        out.write_i64(self.recovery_id);
        self.shard_id.write_to(out);
        out.write_i64(self.global_checkpoint);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        Ok(Self {
            request_seq_no: input.read_i64()?,
            recovery_id: input.read_i64()?,
            shard_id: ShardId::read_from(input)?,
            global_checkpoint: input.read_i64()?,
        })
    }
}

/// Abort the recovery and discard everything staged for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub recovery_id: i64,
    pub shard_id: ShardId,
    pub reason: String,
}

impl CancelRequest {
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_i64(self.recovery_id);
        self.shard_id.write_to(out);
        out.write_string(&self.reason);
    }

    pub fn read_from(input: &mut StreamInput<'_>) -> CodecResult<Self> {
        Ok(Self {
            recovery_id: input.read_i64()?,
            shard_id: ShardId::read_from(input)?,
            reason: input.read_string()?,
        })
    }
}

/// Source → target request envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryRequest {
    FilesInfo(FilesInfoRequest),
    FileChunk(FileChunkRequest),
    FilesComplete(FilesCompleteRequest),
    TranslogOps(TranslogOpsRequest),
    Finalize(FinalizeRequest),
    Cancel(CancelRequest),
}

impl RecoveryRequest {
    fn tag(&self) -> u8 {
        match self {
            RecoveryRequest::FilesInfo(_) => 1,
            RecoveryRequest::FileChunk(_) => 2,
            RecoveryRequest::FilesComplete(_) => 3,
            RecoveryRequest::TranslogOps(_) => 4,
            RecoveryRequest::Finalize(_) => 5,
            RecoveryRequest::Cancel(_) => 6,
        }
    }

    /// Action name used in logs and timeout errors.
    pub fn action(&self) -> &'static str {
        match self {
            RecoveryRequest::FilesInfo(_) => "files_info",
            RecoveryRequest::FileChunk(_) => "file_chunk",
            RecoveryRequest::FilesComplete(_) => "files_complete",
            RecoveryRequest::TranslogOps(_) => "translog_ops",
            RecoveryRequest::Finalize(_) => "finalize",
            RecoveryRequest::Cancel(_) => "cancel",
        }
    }

    pub fn recovery_id(&self) -> i64 {
        match self {
            RecoveryRequest::FilesInfo(r) => r.recovery_id,
            RecoveryRequest::FileChunk(r) => r.recovery_id,
            RecoveryRequest::FilesComplete(r) => r.recovery_id,
            RecoveryRequest::TranslogOps(r) => r.recovery_id,
            RecoveryRequest::Finalize(r) => r.recovery_id,
            RecoveryRequest::Cancel(r) => r.recovery_id,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        match self {
            RecoveryRequest::FilesInfo(r) => &r.shard_id,
            RecoveryRequest::FileChunk(r) => &r.shard_id,
            RecoveryRequest::FilesComplete(r) => &r.shard_id,
            RecoveryRequest::TranslogOps(r) => &r.shard_id,
            RecoveryRequest::Finalize(r) => &r.shard_id,
            RecoveryRequest::Cancel(r) => &r.shard_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = StreamOutput::new();
        out.write_u8(self.tag());
        match self {
            RecoveryRequest::FilesInfo(r) => r.write_to(&mut out),
            RecoveryRequest::FileChunk(r) => r.write_to(&mut out),
            RecoveryRequest::FilesComplete(r) => r.write_to(&mut out),
            RecoveryRequest::TranslogOps(r) => r.write_to(&mut out),
            RecoveryRequest::Finalize(r) => r.write_to(&mut out),
            RecoveryRequest::Cancel(r) => r.write_to(&mut out),
        }
        out.into_bytes()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut input = StreamInput::new(data);
        let request = match input.read_u8()? {
            1 => RecoveryRequest::FilesInfo(FilesInfoRequest::read_from(&mut input)?),
            2 => RecoveryRequest::FileChunk(FileChunkRequest::read_from(&mut input)?),
            3 => RecoveryRequest::FilesComplete(FilesCompleteRequest::read_from(&mut input)?),
            4 => RecoveryRequest::TranslogOps(TranslogOpsRequest::read_from(&mut input)?),
            5 => RecoveryRequest::Finalize(FinalizeRequest::read_from(&mut input)?),
            6 => RecoveryRequest::Cancel(CancelRequest::read_from(&mut input)?),
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "recovery request",
                    tag,
                })
            }
        };
        input.finish()?;
        Ok(request)
    }
}

/// Target → source reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryResponse {
    Ack,
    ChunkAck { position: u64 },
    OpsAck { local_checkpoint: i64 },
    FinalizeAck { local_checkpoint: i64 },
    Failure { code: String, message: String },
}

impl RecoveryResponse {
    pub fn failure(err: &RecoveryError) -> Self {
        RecoveryResponse::Failure {
            code: err.kind().code().to_string(),
            message: err.message().to_string(),
        }
    }

    /// Turn a failure reply back into an error; other replies pass through.
    pub fn into_result(self) -> Result<Self, RecoveryError> {
        match self {
            RecoveryResponse::Failure { code, message } => {
                let kind =
                    RecoveryErrorKind::from_code(&code).unwrap_or(RecoveryErrorKind::Transport);
                Err(RecoveryError::new(kind, format!("target failed: {}", message)))
            }
            other => Ok(other),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = StreamOutput::new();
        match self {
            RecoveryResponse::Ack => out.write_u8(0),
            RecoveryResponse::ChunkAck { position } => {
                out.write_u8(1);
                out.write_vlong(*position);
            }
            RecoveryResponse::OpsAck { local_checkpoint } => {
                out.write_u8(2);
                out.write_i64(*local_checkpoint);
            }
            RecoveryResponse::FinalizeAck { local_checkpoint } => {
                out.write_u8(3);
                out.write_i64(*local_checkpoint);
            }
            RecoveryResponse::Failure { code, message } => {
                out.write_u8(4);
                out.write_string(code);
                out.write_string(message);
            }
        }
        out.into_bytes()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut input = StreamInput::new(data);
        let response = match input.read_u8()? {
            0 => RecoveryResponse::Ack,
            1 => RecoveryResponse::ChunkAck {
                position: input.read_vlong()?,
            },
            2 => RecoveryResponse::OpsAck {
                local_checkpoint: input.read_i64()?,
            },
            3 => RecoveryResponse::FinalizeAck {
                local_checkpoint: input.read_i64()?,
            },
            4 => RecoveryResponse::Failure {
                code: input.read_string()?,
                message: input.read_string()?,
            },
            tag => {
                return Err(CodecError::UnknownTag {
                    what: "recovery response",
                    tag,
                })
            }
        };
        input.finish()?;
        Ok(response)
    }
}
