//! The ordered stream of frozen update packets.
//!
//! Every flush pushes its packets here, each stamped with the next
//! generation. Every segment remembers the generation of the last packet
//! applied to it (a flushed segment starts at its own private packet's
//! generation), so applying the stream to a set of segments only has to
//! pick, per segment, the global packets it has not seen yet:
//!
//! * a global packet newer than the segment applies to it in full,
//! * the segment's own private packet applies with its doc id bounds,
//! * anything older already reached the segment.
//!
//! Segments and packets are walked together, newest first, coalescing
//! global packets as they are passed. Applied segments are stamped with a
//! fresh generation and packets older than every segment are pruned.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::index::buffered_updates::{FrozenUpdates, MAX_DOC_ID_UPTO};
use crate::index::catalog::SegmentCatalog;
use crate::index::field_updates::FieldUpdates;
use crate::index::info_stream::{BD, InfoStream};
use crate::index::reader_pool::ReaderPool;
use crate::index::segment_reader::SegmentReader;
use crate::index::segment_record::SegmentRecord;
use crate::index::segment_view::SegmentView;

/// Outcome of [`BufferedUpdatesStream::apply_deletes_and_updates`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// Whether any document was newly deleted.
    pub any_deletes: bool,
    /// Generation stamped on every segment the packets were applied to.
    pub generation: u64,
    /// Segments left without a live document, in no particular order.
    pub all_deleted: Vec<String>,
}

/// Global packets passed on the way down, newest first.
#[derive(Debug, Default)]
struct CoalescedUpdates {
    packets: Vec<Arc<FrozenUpdates>>,
}

impl CoalescedUpdates {
    fn push(&mut self, packet: &Arc<FrozenUpdates>) {
        self.packets.push(Arc::clone(packet));
    }

    /// Packets oldest first, which is the order their updates must apply in.
    fn oldest_first(&self) -> impl Iterator<Item = &Arc<FrozenUpdates>> {
        self.packets.iter().rev()
    }
}

pub struct BufferedUpdatesStream {
    updates: Vec<Arc<FrozenUpdates>>,
    next_gen: u64,
    bytes_used: usize,
    num_terms: usize,
    info_stream: Arc<dyn InfoStream>,
}

impl fmt::Debug for BufferedUpdatesStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedUpdatesStream")
            .field("packets", &self.updates.len())
            .field("next_gen", &self.next_gen)
            .field("bytes_used", &self.bytes_used)
            .finish()
    }
}

impl BufferedUpdatesStream {
    pub fn new(info_stream: Arc<dyn InfoStream>) -> Self {
        BufferedUpdatesStream {
            updates: Vec::new(),
            // Generation 0 is that of segments no packet was applied to.
            next_gen: 1,
            bytes_used: 0,
            num_terms: 0,
            info_stream,
        }
    }

    fn message(&self, message: impl FnOnce() -> String) {
        if self.info_stream.is_enabled(BD) {
            self.info_stream.message(BD, &message());
        }
    }

    /// Append a packet, stamping it with the next generation.
    pub fn push(&mut self, mut packet: FrozenUpdates) -> u64 {
        let generation = self.next_gen();
        packet.set_generation(generation);
        self.num_terms += packet.terms().len();
        self.bytes_used += packet.bytes_used();
        self.message(|| {
            format!(
                "push deletes {packet} segmentPrivate?={} packetCount={}",
                packet.is_segment_private(),
                self.updates.len() + 1
            )
        });
        self.updates.push(Arc::new(packet));
        generation
    }

    /// Take a generation without pushing anything.
    pub fn next_gen(&mut self) -> u64 {
        let generation = self.next_gen;
        self.next_gen += 1;
        generation
    }

    pub fn any(&self) -> bool {
        self.bytes_used != 0 || !self.updates.is_empty()
    }

    pub fn packet_count(&self) -> usize {
        self.updates.len()
    }

    pub fn num_terms(&self) -> usize {
        self.num_terms
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn clear(&mut self) {
        self.updates.clear();
        self.next_gen = 1;
        self.num_terms = 0;
        self.bytes_used = 0;
    }

    /// Apply every packet not yet seen by the segments `names` of `catalog`.
    pub fn apply_deletes_and_updates(
        &mut self,
        pool: &mut ReaderPool,
        catalog: &mut SegmentCatalog,
        names: &[String],
    ) -> Result<ApplyResult> {
        let generation = self.next_gen();

        let mut infos: Vec<(String, u64)> = names
            .iter()
            .filter_map(|name| {
                catalog
                    .get(name)
                    .map(|record| (name.clone(), record.buffered_deletes_gen()))
            })
            .collect();

        if infos.is_empty() || self.updates.is_empty() {
            self.message(|| "applyDeletes: no deletes; skipping".to_string());
            return Ok(ApplyResult {
                any_deletes: false,
                generation,
                all_deleted: Vec::new(),
            });
        }

        self.message(|| {
            format!(
                "applyDeletes: infos={infos:?} packetCount={}",
                self.updates.len()
            )
        });
        infos.sort_by_key(|(_, segment_gen)| *segment_gen);

        let mut coalesced: Option<CoalescedUpdates> = None;
        let mut any_deletes = false;
        let mut all_deleted = Vec::new();

        let mut packet_idx = self.updates.len();
        let mut info_idx = infos.len();

        while info_idx > 0 {
            let (name, segment_gen) = &infos[info_idx - 1];
            let packet = packet_idx
                .checked_sub(1)
                .map(|idx| Arc::clone(&self.updates[idx]));

            match packet {
                Some(packet) if *segment_gen < packet.generation() => {
                    if !packet.is_segment_private() && packet.any() {
                        coalesced.get_or_insert_with(Default::default).push(&packet);
                    }
                    packet_idx -= 1;
                }
                Some(packet) if *segment_gen == packet.generation() => {
                    debug_assert!(
                        packet.is_segment_private(),
                        "only a private packet shares its segment's generation"
                    );
                    let Some(record) = catalog.get_mut(name) else {
                        info_idx -= 1;
                        packet_idx -= 1;
                        continue;
                    };
                    let (del_count, fully_deleted) =
                        apply_to_segment(pool, record, Some(&packet), coalesced.as_ref())?;
                    self.message(|| {
                        format!(
                            "seg={name} segGen={segment_gen} segDeletes=[{packet}]; coalesced={}; newDelCount={del_count}{}",
                            coalesced.as_ref().map_or(0, |c| c.packets.len()),
                            if fully_deleted { " 100% deleted" } else { "" }
                        )
                    });
                    any_deletes |= del_count > 0;
                    if fully_deleted {
                        all_deleted.push(name.clone());
                    }
                    record.set_buffered_deletes_gen(generation);
                    packet_idx -= 1;
                    info_idx -= 1;
                }
                _ => {
                    if let Some(coalesced) = &coalesced {
                        let Some(record) = catalog.get_mut(name) else {
                            info_idx -= 1;
                            continue;
                        };
                        let (del_count, fully_deleted) =
                            apply_to_segment(pool, record, None, Some(coalesced))?;
                        self.message(|| {
                            format!(
                                "seg={name} segGen={segment_gen} coalesced={}; newDelCount={del_count}{}",
                                coalesced.packets.len(),
                                if fully_deleted { " 100% deleted" } else { "" }
                            )
                        });
                        any_deletes |= del_count > 0;
                        if fully_deleted {
                            all_deleted.push(name.clone());
                        }
                        record.set_buffered_deletes_gen(generation);
                    }
                    info_idx -= 1;
                }
            }
        }

        self.message(|| {
            format!(
                "applyDeletes took; new gen={generation}; allDeleted={all_deleted:?}; packets={}",
                self.updates.len()
            )
        });

        Ok(ApplyResult {
            any_deletes,
            generation,
            all_deleted,
        })
    }

    /// Drop packets older than every segment of `catalog`.
    pub fn prune(&mut self, catalog: &SegmentCatalog) {
        let min_gen = catalog
            .iter()
            .map(SegmentRecord::buffered_deletes_gen)
            .min()
            .unwrap_or(u64::MAX);
        self.prune_below(min_gen);
    }

    fn prune_below(&mut self, min_gen: u64) {
        // Strictly older: a segment flushed with a private packet carries
        // that packet's generation and still needs it applied.
        let count = self
            .updates
            .iter()
            .take_while(|packet| packet.generation() < min_gen)
            .count();
        if count == 0 {
            return;
        }

        self.message(|| {
            format!(
                "pruneDeletes: prune {count} packets; {} packets remain",
                self.updates.len() - count
            )
        });
        for packet in self.updates.drain(..count) {
            self.num_terms -= packet.terms().len();
            self.bytes_used -= packet.bytes_used();
        }
    }
}

/// Apply `private` and then `coalesced` to one segment. Returns the number
/// of newly deleted documents and whether none is left.
fn apply_to_segment(
    pool: &mut ReaderPool,
    record: &mut SegmentRecord,
    private: Option<&Arc<FrozenUpdates>>,
    coalesced: Option<&CoalescedUpdates>,
) -> Result<(u32, bool)> {
    let view = pool.acquire(record, true)?;
    let applied = apply_with_view(view, record, private, coalesced);
    let fully_deleted = view.is_fully_deleted(record);
    let released = pool.release(record);

    let del_count = applied?;
    released?;
    Ok((del_count, fully_deleted))
}

fn apply_with_view(
    view: &mut SegmentView,
    record: &mut SegmentRecord,
    private: Option<&Arc<FrozenUpdates>>,
    coalesced: Option<&CoalescedUpdates>,
) -> Result<u32> {
    let reader = view.reader(record)?;
    let mut del_count = 0;
    let mut field_updates = FieldUpdates::new();

    if let Some(packet) = private {
        del_count += apply_packet(view, record, &reader, packet, true, &mut field_updates)?;
    }
    if let Some(coalesced) = coalesced {
        for packet in coalesced.oldest_first() {
            del_count += apply_packet(view, record, &reader, packet, false, &mut field_updates)?;
        }
    }

    if field_updates.any() {
        view.apply_field_updates(record, &field_updates)?;
    }
    Ok(del_count)
}

/// Bounds of a private packet hold; a global packet reaches every document
/// of a segment flushed before it.
fn apply_packet(
    view: &mut SegmentView,
    record: &SegmentRecord,
    reader: &SegmentReader,
    packet: &FrozenUpdates,
    bounded: bool,
    field_updates: &mut FieldUpdates,
) -> Result<u32> {
    let limit = |upto: u32| if bounded { upto } else { MAX_DOC_ID_UPTO };
    let mut del_count = 0;

    for (term, upto) in packet.terms() {
        let upto = limit(*upto);
        for doc in reader.postings(term) {
            if *doc < upto && view.delete(record, *doc)? {
                del_count += 1;
            }
        }
    }

    for (query, upto) in packet.queries() {
        let upto = limit(*upto);
        for doc in query.doc_ids(reader)? {
            if doc < upto && view.delete(record, doc)? {
                del_count += 1;
            }
        }
    }

    for update in packet.numeric_updates() {
        let upto = limit(update.doc_id_upto);
        for doc in reader.postings(&update.term) {
            if *doc < upto {
                field_updates.set_numeric(&update.field, *doc, update.value);
            }
        }
    }

    for update in packet.binary_updates() {
        let upto = limit(update.doc_id_upto);
        for doc in reader.postings(&update.term) {
            if *doc < upto {
                field_updates.set_binary(&update.field, *doc, update.value.clone());
            }
        }
    }

    Ok(del_count)
}
