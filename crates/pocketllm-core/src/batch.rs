use crate::error::{SessionError, SessionResult};
use crate::runtime::{Position, SeqId, TokenId};

/// Sequence used for every slot: sessions never interleave sequences.
pub const DEFAULT_SEQ: SeqId = 0;

/// Fixed-capacity decode batch laid out as parallel arrays, one entry per slot.
///
/// Storage is allocated once; [`Batch::clear`] only resets the fill counter so
/// the same batch is reused for every prompt chunk and every generated token.
#[derive(Debug, Clone)]
pub struct Batch {
    token: Vec<TokenId>,
    pos: Vec<Position>,
    n_seq_id: Vec<i32>,
    seq_id: Vec<SeqId>,
    logits: Vec<bool>,
    n_tokens: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        Self {
            token: vec![0; capacity],
            pos: vec![0; capacity],
            n_seq_id: vec![0; capacity],
            seq_id: vec![DEFAULT_SEQ; capacity],
            logits: vec![false; capacity],
            n_tokens: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.token.len()
    }

    pub fn len(&self) -> usize {
        self.n_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Append one slot.
    pub fn push(
        &mut self,
        token: TokenId,
        pos: Position,
        seq: SeqId,
        logits: bool,
    ) -> SessionResult<()> {
        let i = self.n_tokens;
        if i >= self.capacity() {
            return Err(SessionError::BatchOverflow { capacity: self.capacity() });
        }
        self.token[i] = token;
        self.pos[i] = pos;
        self.n_seq_id[i] = 1;
        self.seq_id[i] = seq;
        self.logits[i] = logits;
        self.n_tokens += 1;
        Ok(())
    }

    /// Refill the batch with one prompt chunk starting at position `start`.
    ///
    /// Positions are contiguous, every slot belongs to sequence 0, and only the
    /// final slot requests logits.
    pub fn load_chunk(&mut self, chunk: &[TokenId], start: usize) -> SessionResult<()> {
        self.clear();
        let last = chunk.len().saturating_sub(1);
        for (j, &token) in chunk.iter().enumerate() {
            self.push(token, (start + j) as Position, DEFAULT_SEQ, j == last)?;
        }
        Ok(())
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.token[..self.n_tokens]
    }

    pub fn positions(&self) -> &[Position] {
        &self.pos[..self.n_tokens]
    }

    pub fn seq_ids(&self) -> &[SeqId] {
        &self.seq_id[..self.n_tokens]
    }

    pub fn n_seq_ids(&self) -> &[i32] {
        &self.n_seq_id[..self.n_tokens]
    }

    pub fn logits(&self) -> &[bool] {
        &self.logits[..self.n_tokens]
    }
}
