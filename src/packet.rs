//! # Packet Builder
//!
//! Incrementally assembles size-bounded IPFIX datagrams from externally
//! owned Data Sets and from Template Records synthesized into small owned
//! Sets. Grounded on `storage/forwarding/packet.c`: the `parts` list
//! (`bldr_add_dataset`/`bldr_add_template`), the template-set soft cap
//! (`BLDR_TMPLT_SET_MAX`), and the packet partitioning algorithm
//! (`parts_packets_prepare`).
//!
//! Data Set bytes are referenced zero-copy from the caller's message
//! buffer (lifetime `'a`); Template Sets are necessarily synthesized
//! (several records from possibly different buffers are packed into one
//! contiguous Set), so their bytes are owned by the builder. Rather than a
//! shared mutable arena borrowed by in-flight emissions (the original's
//! design, and the reason it restricts itself to one live emission at a
//! time — see spec's open question on `bldr_pkts_iovec`), the 16-byte
//! datagram header lives in a single field rewritten per emission; this
//! keeps the same one-emission-at-a-time contract without unsafe code.

use std::io::IoSlice;

use crate::templates::{Odid, TemplateId, TemplateType};

const IPFIX_HEADER_LEN: usize = 16;
const PACKET_MIN_SIZE: usize = 256;
const TEMPLATE_SET_SOFT_CAP: usize = 512;

enum PartData<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl<'a> PartData<'a> {
    fn as_slice(&self) -> &[u8] {
        match self {
            PartData::Borrowed(b) => b,
            PartData::Owned(v) => v,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

struct Part<'a> {
    data: PartData<'a>,
    starts_set: bool,
    record_count: u32,
}

struct PacketMeta {
    part_start: usize,
    part_count: usize,
    record_count: u32,
    total_len: usize,
}

/// Identity of the most recently appended Set, used to decide whether a new
/// Template/Withdrawal record can continue it. Mirrors `packet.c`'s
/// `last_set_type`: a definition Set and a withdrawal Set of the same
/// `TemplateType` are never the same Set, and any other Set appended in
/// between (a Data Set, or a Set of the other kind/type) ends the run.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SetKind {
    Template(TemplateType),
    Withdrawal(TemplateType),
}

impl SetKind {
    fn ttype(self) -> TemplateType {
        match self {
            SetKind::Template(t) | SetKind::Withdrawal(t) => t,
        }
    }
}

/// One reusable builder: `start` → `add_*` → `end` → `emit_*` → `start`.
pub struct PacketBuilder<'a> {
    header: [u8; 16],
    odid: Odid,
    export_time: u32,
    parts: Vec<Part<'a>>,
    packets: Vec<PacketMeta>,
    last_set: Option<(SetKind, usize)>,
}

impl<'a> Default for PacketBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> PacketBuilder<'a> {
    pub fn new() -> Self {
        let mut header = [0u8; 16];
        header[0..2].copy_from_slice(&10u16.to_be_bytes());
        Self { header, odid: 0, export_time: 0, parts: Vec::new(), packets: Vec::new(), last_set: None }
    }

    /// Clears all builder state and stamps the ODID/export time that every
    /// part appended until the next `start()` will share.
    pub fn start(&mut self, odid: Odid, export_time: u32) {
        self.odid = odid;
        self.export_time = export_time;
        self.parts.clear();
        self.packets.clear();
        self.last_set = None;
    }

    /// References `bytes` (the full Data Set, including its 4-byte Set
    /// header) zero-copy, unless `new_id` differs from the Set's own
    /// flowset_id, in which case a 4-byte replacement header is synthesized
    /// and the body referenced separately.
    pub fn add_data_set(&mut self, bytes: &'a [u8], new_id: TemplateId, record_count: u32) {
        debug_assert!(bytes.len() >= 4, "caller must validate Set length before appending");
        let existing_id = u16::from_be_bytes([bytes[0], bytes[1]]);

        if existing_id == new_id {
            self.parts.push(Part { data: PartData::Borrowed(bytes), starts_set: true, record_count });
        } else {
            let mut header = Vec::with_capacity(4);
            header.extend_from_slice(&new_id.to_be_bytes());
            header.extend_from_slice(&bytes[2..4]);
            self.parts.push(Part { data: PartData::Owned(header), starts_set: true, record_count });
            self.parts.push(Part { data: PartData::Borrowed(&bytes[4..]), starts_set: false, record_count: 0 });
        }
        // A Data Set is never mergeable with anything; it also ends any run
        // of Template/Withdrawal Sets so a later one doesn't splice into a
        // Set that no longer sits at the tail of the parts list.
        self.last_set = None;
    }

    fn flowset_id_for(ttype: TemplateType) -> u16 {
        match ttype {
            TemplateType::Normal => 2,
            TemplateType::Options => 3,
        }
    }

    /// Appends `record` to the trailing Set of `kind`, opening a new Set if
    /// the immediately preceding Set isn't of the same kind (same
    /// `TemplateType` *and* same definition-vs-withdrawal role) or the soft
    /// cap would be exceeded.
    fn append_to_set(&mut self, kind: SetKind, record: &[u8]) {
        let needs_new_set = match self.last_set {
            Some((last_kind, part_index)) if last_kind == kind => {
                self.parts[part_index].data.len() + record.len() > TEMPLATE_SET_SOFT_CAP
            }
            _ => true,
        };

        if needs_new_set {
            let mut buf = Vec::with_capacity(4 + record.len());
            buf.extend_from_slice(&Self::flowset_id_for(kind.ttype()).to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
            let part_index = self.parts.len();
            self.parts.push(Part { data: PartData::Owned(buf), starts_set: true, record_count: 0 });
            self.last_set = Some((kind, part_index));
        }

        let part_index = self.last_set.map(|(_, i)| i).expect("just ensured above");
        if let PartData::Owned(buf) = &mut self.parts[part_index].data {
            buf.extend_from_slice(record);
            let len = buf.len() as u16;
            buf[2..4].copy_from_slice(&len.to_be_bytes());
        }
    }

    /// Appends a Template Record, synthesizing a replacement 4-byte header
    /// when its own Template ID differs from `new_id`.
    pub fn add_template(&mut self, rec: &[u8], new_id: TemplateId, ttype: TemplateType) {
        debug_assert!(rec.len() >= 4);
        let current_id = u16::from_be_bytes([rec[0], rec[1]]);

        if current_id == new_id {
            self.append_to_set(SetKind::Template(ttype), rec);
        } else {
            let mut replacement = Vec::with_capacity(rec.len());
            replacement.extend_from_slice(&new_id.to_be_bytes());
            replacement.extend_from_slice(&rec[2..]);
            self.append_to_set(SetKind::Template(ttype), &replacement);
        }
    }

    /// Appends a 4-byte withdrawal record (`id`, count = 0). Withdrawals
    /// never continue a definition Set of the same type, and vice versa:
    /// each role keeps its own run of trailing Sets (spec.md §4.2).
    pub fn add_template_withdrawal(&mut self, id: TemplateId, ttype: TemplateType) {
        let mut rec = [0u8; 4];
        rec[0..2].copy_from_slice(&id.to_be_bytes());
        self.append_to_set(SetKind::Withdrawal(ttype), &rec);
    }

    /// Partitions the accumulated parts into one or more packets targeting
    /// `max_size` bytes. A Set is only ever split from its neighbors, never
    /// internally. `max_size` is first clamped up to the minimum floor (256)
    /// so that floor is honored for every non-final, non-oversized packet
    /// (spec.md §4.2 partitioning rule / §8 invariant 4); a Set is appended
    /// to the current packet whenever it still fits, or the packet is empty
    /// so far (a single oversized Set always gets its own packet), mirroring
    /// `parts_packets_prepare`'s `cur_len + next_len <= max_size || parts_cnt
    /// == 0` continuation test.
    pub fn end(&mut self, max_size: u16) {
        self.packets.clear();
        if self.parts.is_empty() {
            return;
        }
        let max_size = (max_size as usize).max(PACKET_MIN_SIZE);

        // Collect Set spans: (part_start, part_count, byte_len).
        let mut sets = Vec::new();
        let mut i = 0;
        while i < self.parts.len() {
            let start = i;
            let mut len = self.parts[i].data.len();
            i += 1;
            while i < self.parts.len() && !self.parts[i].starts_set {
                len += self.parts[i].data.len();
                i += 1;
            }
            sets.push((start, i - start, len));
        }

        let mut pkt_first_set = 0usize;
        let mut cur_len = IPFIX_HEADER_LEN;

        for idx in 0..sets.len() {
            let (_, _, set_len) = sets[idx];
            let sets_in_current = idx - pkt_first_set;
            if sets_in_current >= 1 && cur_len + set_len > max_size {
                self.close_packet(&sets, pkt_first_set, idx);
                pkt_first_set = idx;
                cur_len = IPFIX_HEADER_LEN;
            }
            cur_len += set_len;
        }
        self.close_packet(&sets, pkt_first_set, sets.len());
    }

    fn close_packet(&mut self, sets: &[(usize, usize, usize)], first: usize, last_exclusive: usize) {
        if first >= last_exclusive {
            return;
        }
        let (part_start, _, _) = sets[first];
        let (last_part_start, last_part_count, _) = sets[last_exclusive - 1];
        let part_count = (last_part_start + last_part_count) - part_start;
        let byte_len: usize = sets[first..last_exclusive].iter().map(|(_, _, l)| l).sum();
        let record_count: u32 = self.parts[part_start..part_start + part_count].iter().map(|p| p.record_count).sum();

        self.packets.push(PacketMeta {
            part_start,
            part_count,
            record_count,
            total_len: IPFIX_HEADER_LEN + byte_len,
        });
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn packet_odid(&self) -> Odid {
        self.odid
    }

    pub fn packet_record_count(&self, idx: usize) -> u32 {
        self.packets[idx].record_count
    }

    fn write_header(&mut self, seq_no: u32, total_len: u16) {
        self.header[2..4].copy_from_slice(&total_len.to_be_bytes());
        self.header[4..8].copy_from_slice(&self.export_time.to_be_bytes());
        self.header[8..12].copy_from_slice(&seq_no.to_be_bytes());
        self.header[12..16].copy_from_slice(&self.odid.to_be_bytes());
    }

    /// Returns a scatter/gather view of packet `idx` suitable for a single
    /// vectored write, plus its Data Record count. Only one emission's
    /// iovec should be in flight at a time: the next call overwrites the
    /// shared header field.
    pub fn emit_as_iovec(&mut self, seq_no: u32, idx: usize) -> (Vec<IoSlice<'_>>, u32) {
        let meta_total_len = self.packets[idx].total_len as u16;
        self.write_header(seq_no, meta_total_len);

        let meta = &self.packets[idx];
        let mut iov = Vec::with_capacity(meta.part_count + 1);
        iov.push(IoSlice::new(&self.header));
        for part in &self.parts[meta.part_start..meta.part_start + meta.part_count] {
            iov.push(IoSlice::new(part.data.as_slice()));
        }
        (iov, meta.record_count)
    }

    /// Allocates a contiguous copy of packet `idx` starting `offset` bytes
    /// in, for resuming a partially sent packet.
    pub fn emit_as_bytes(&mut self, seq_no: u32, idx: usize, offset: usize) -> (Vec<u8>, u32) {
        let meta_total_len = self.packets[idx].total_len as u16;
        self.write_header(seq_no, meta_total_len);

        let meta = &self.packets[idx];
        let mut buf = Vec::with_capacity(meta.total_len);
        buf.extend_from_slice(&self.header);
        for part in &self.parts[meta.part_start..meta.part_start + meta.part_count] {
            buf.extend_from_slice(part.data.as_slice());
        }

        let record_count = meta.record_count;
        if offset >= buf.len() {
            (Vec::new(), record_count)
        } else {
            (buf.split_off(offset), record_count)
        }
    }
}
