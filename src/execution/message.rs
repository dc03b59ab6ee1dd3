use std::fmt::Display;

use crate::{error::ExecError, types::Time};

use super::{group_key::GroupKey, plan::NodeId, table::{Chunk, Table}};

/// Identifies the output of one copy of a plan node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId {
    pub node: NodeId,
    pub copy: usize,
}

impl DatasetId {
    pub fn new(node: NodeId, copy: usize) -> DatasetId {
        DatasetId { node, copy }
    }
}

impl Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.copy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    RetractTable,
    Process,
    UpdateWatermark,
    UpdateProcessingTime,
    Finish,
    ProcessChunk,
    FlushKey,
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::RetractTable => "retract_table",
            MessageType::Process => "process",
            MessageType::UpdateWatermark => "update_watermark",
            MessageType::UpdateProcessingTime => "update_processing_time",
            MessageType::Finish => "finish",
            MessageType::ProcessChunk => "process_chunk",
            MessageType::FlushKey => "flush_key",
        };
        write!(f, "{}", name)
    }
}

/// A message sent from one dataset to the next operator.
///
/// Payloads are reference counted. A message is acknowledged by consuming it with
/// [`Message::ack`] (or by dropping it), which releases whatever it retained. Sending
/// one message to several receivers needs a [`Message::dup`] per receiver.
#[derive(Debug)]
pub enum Message {
    /// Retract the table previously sent for the key.
    RetractTable { src: DatasetId, key: GroupKey },
    /// A whole table, sent by datasets that buffer per key.
    Process { src: DatasetId, table: Table },
    /// No rows older than the time will arrive anymore.
    UpdateWatermark { src: DatasetId, time: Time },
    UpdateProcessingTime { src: DatasetId, time: Time },
    /// No more messages from the source, possibly because it failed.
    Finish { src: DatasetId, err: Option<ExecError> },
    ProcessChunk { src: DatasetId, chunk: Chunk },
    /// The source will not send any more data for the key.
    FlushKey { src: DatasetId, key: GroupKey },
}

impl Message {
    pub fn src(&self) -> &DatasetId {
        match self {
            Message::RetractTable { src, .. }
            | Message::Process { src, .. }
            | Message::UpdateWatermark { src, .. }
            | Message::UpdateProcessingTime { src, .. }
            | Message::Finish { src, .. }
            | Message::ProcessChunk { src, .. }
            | Message::FlushKey { src, .. } => src,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RetractTable { .. } => MessageType::RetractTable,
            Message::Process { .. } => MessageType::Process,
            Message::UpdateWatermark { .. } => MessageType::UpdateWatermark,
            Message::UpdateProcessingTime { .. } => MessageType::UpdateProcessingTime,
            Message::Finish { .. } => MessageType::Finish,
            Message::ProcessChunk { .. } => MessageType::ProcessChunk,
            Message::FlushKey { .. } => MessageType::FlushKey,
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Message::Finish { .. })
    }

    /// A second handle to the same message. Retains the payload.
    pub fn dup(&self) -> Message {
        match self {
            Message::RetractTable { src, key } => Message::RetractTable { src: src.clone(), key: key.clone() },
            Message::Process { src, table } => Message::Process { src: src.clone(), table: table.clone() },
            Message::UpdateWatermark { src, time } => Message::UpdateWatermark { src: src.clone(), time: *time },
            Message::UpdateProcessingTime { src, time } => Message::UpdateProcessingTime { src: src.clone(), time: *time },
            Message::Finish { src, err } => Message::Finish { src: src.clone(), err: err.clone() },
            Message::ProcessChunk { src, chunk } => Message::ProcessChunk { src: src.clone(), chunk: chunk.clone() },
            Message::FlushKey { src, key } => Message::FlushKey { src: src.clone(), key: key.clone() },
        }
    }

    /// Acknowledges the message and releases its payload.
    pub fn ack(self) {}
}
