//! Relationship chain maintenance.
//!
//! Every node heads a doubly-linked list of its incident relationships; a
//! relationship occupies one position per endpoint (two for a self-loop).
//! New relationships are prepended. All operations are O(1) in chain
//! traversal; the cost is write locks on the neighbors being patched.

use crate::error::{Result, SableError};
use crate::records::NO_RELATIONSHIP;
use crate::tx::write::WriteTransaction;

/// Which chain pointer of a neighbor gets patched during a splice.
#[derive(Debug, Clone, Copy)]
enum ChainField {
    Prev,
    Next,
}

impl WriteTransaction {
    /// Splices `rel_id` in as the new head of both endpoint chains.
    pub(crate) fn connect_relationship(
        &mut self,
        rel_id: u64,
        first_node_id: u64,
        second_node_id: u64,
    ) -> Result<()> {
        let first_head = self.node_record(first_node_id)?.next_rel;
        let second_head = self.node_record(second_node_id)?.next_rel;
        debug_assert_ne!(first_head, rel_id);
        debug_assert_ne!(second_head, rel_id);
        {
            let record = self.rel_record(rel_id)?;
            record.first_next_rel = first_head;
            record.second_next_rel = second_head;
        }
        self.connect(first_node_id, rel_id)?;
        self.connect(second_node_id, rel_id)?;
        self.node_record(first_node_id)?.next_rel = rel_id;
        self.node_record(second_node_id)?.next_rel = rel_id;
        Ok(())
    }

    /// Points the old head's prev back at the new head, on whichever of its
    /// sides faces `node_id`. A self-loop head matches on both sides.
    fn connect(&mut self, node_id: u64, rel_id: u64) -> Result<()> {
        let head = self.node_record(node_id)?.next_rel;
        if head == NO_RELATIONSHIP {
            return Ok(());
        }
        self.acquire_rel_write_lock(head)?;
        let next = self.rel_record(head)?;
        let mut changed = false;
        if next.first_node == node_id {
            next.first_prev_rel = rel_id;
            changed = true;
        }
        if next.second_node == node_id {
            next.second_prev_rel = rel_id;
            changed = true;
        }
        if !changed {
            return Err(SableError::Integrity(format!(
                "node {node_id} does not match relationship {head}"
            )));
        }
        Ok(())
    }

    /// Un-splices the relationship from both endpoint chains by patching up
    /// to four neighbors past it. Pointer values are re-read before each
    /// patch because a self-loop can make the relationship its own neighbor.
    pub(crate) fn disconnect_relationship(&mut self, rel_id: u64) -> Result<()> {
        let (first_prev, first_node) = {
            let record = self.rel_record(rel_id)?;
            (record.first_prev_rel, record.first_node)
        };
        if first_prev != NO_RELATIONSHIP {
            let new_next = self.rel_record(rel_id)?.first_next_rel;
            self.patch_neighbor(first_prev, first_node, ChainField::Next, new_next, rel_id)?;
        }

        let (first_next, first_node) = {
            let record = self.rel_record(rel_id)?;
            (record.first_next_rel, record.first_node)
        };
        if first_next != NO_RELATIONSHIP {
            let new_prev = self.rel_record(rel_id)?.first_prev_rel;
            self.patch_neighbor(first_next, first_node, ChainField::Prev, new_prev, rel_id)?;
        }

        let (second_prev, second_node) = {
            let record = self.rel_record(rel_id)?;
            (record.second_prev_rel, record.second_node)
        };
        if second_prev != NO_RELATIONSHIP {
            let new_next = self.rel_record(rel_id)?.second_next_rel;
            self.patch_neighbor(second_prev, second_node, ChainField::Next, new_next, rel_id)?;
        }

        let (second_next, second_node) = {
            let record = self.rel_record(rel_id)?;
            (record.second_next_rel, record.second_node)
        };
        if second_next != NO_RELATIONSHIP {
            let new_prev = self.rel_record(rel_id)?.second_prev_rel;
            self.patch_neighbor(second_next, second_node, ChainField::Prev, new_prev, rel_id)?;
        }
        Ok(())
    }

    /// Rewrites the chain pointer of `neighbor_id` on every side that faces
    /// `endpoint`. A neighbor sharing no side with the endpoint means the
    /// chain is corrupt and the transaction must fail.
    fn patch_neighbor(
        &mut self,
        neighbor_id: u64,
        endpoint: u64,
        field: ChainField,
        value: u64,
        rel_id: u64,
    ) -> Result<()> {
        self.acquire_rel_write_lock(neighbor_id)?;
        let neighbor = self.rel_record(neighbor_id)?;
        let mut changed = false;
        if neighbor.first_node == endpoint {
            match field {
                ChainField::Prev => neighbor.first_prev_rel = value,
                ChainField::Next => neighbor.first_next_rel = value,
            }
            changed = true;
        }
        if neighbor.second_node == endpoint {
            match field {
                ChainField::Prev => neighbor.second_prev_rel = value,
                ChainField::Next => neighbor.second_next_rel = value,
            }
            changed = true;
        }
        if !changed {
            return Err(SableError::Integrity(format!(
                "relationship {neighbor_id} does not share node {endpoint} with relationship {rel_id}"
            )));
        }
        Ok(())
    }

    /// After a disconnect, repoints each endpoint's head when the deleted
    /// relationship was the head of that chain.
    pub(crate) fn update_nodes(&mut self, rel_id: u64) -> Result<()> {
        let record = self.rel_record(rel_id)?.clone();
        if record.first_prev_rel == NO_RELATIONSHIP {
            self.node_record(record.first_node)?.next_rel = record.first_next_rel;
        }
        if record.second_prev_rel == NO_RELATIONSHIP {
            self.node_record(record.second_node)?.next_rel = record.second_next_rel;
        }
        Ok(())
    }
}
