//! Raw DNS packet parser / encoder - binary level per RFC 1035
//! Responses are parsed, their record sections reordered in place,
//! and then re-encoded with fresh name compression.

use crate::dns::types::{RecordType, DnsClass, ResponseCode};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Domain name as raw wire labels (root label excluded).
/// Label bytes are kept as is so a name re-encodes exactly.
pub type Labels = Vec<Vec<u8>>;

#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub rcode: ResponseCode,
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    /// Presentation form, for lookups and logs
    pub name: String,
    pub labels: Labels,
    pub qtype: RecordType,
    pub qclass: DnsClass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecord {
    pub owner: Labels,
    pub rtype: RecordType,
    pub rclass: DnsClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
    /// rdataのパケット内開始オフセット (圧縮ポインタ解決用)
    pub rdata_offset: usize,
}

impl DnsRecord {
    /// Decoded address of an A/AAAA record. None for other types or malformed rdata.
    pub fn address(&self) -> Option<IpAddr> {
        match self.rtype {
            RecordType::A => <[u8; 4]>::try_from(self.rdata.as_slice())
                .ok()
                .map(|octets| IpAddr::V4(Ipv4Addr::from(octets))),
            RecordType::AAAA => <[u8; 16]>::try_from(self.rdata.as_slice())
                .ok()
                .map(|octets| IpAddr::V6(Ipv6Addr::from(octets))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
    pub raw: Vec<u8>,
}

/// Parse a DNS name as raw labels, following compression pointers (RFC 1035 §4.1.4)
pub fn parse_labels(data: &[u8], offset: &mut usize) -> anyhow::Result<Labels> {
    let mut labels = Vec::new();
    let mut jumped = false;
    let mut pos = *offset;
    let mut jumps_performed = 0;
    const MAX_JUMPS: usize = 10; // Prevent infinite loops

    loop {
        if pos >= data.len() {
            return Err(anyhow::anyhow!("DNS name parse: unexpected end of data at offset {}", pos));
        }

        let len_byte = data[pos];

        // Pointer - top 2 bits are 11
        if (len_byte & 0xC0) == 0xC0 {
            if pos + 1 >= data.len() {
                return Err(anyhow::anyhow!("DNS name parse: truncated pointer at offset {}", pos));
            }
            if !jumped {
                *offset = pos + 2;
                jumped = true;
            }
            let pointer = ((len_byte as u16 & 0x3F) << 8) | data[pos + 1] as u16;
            pos = pointer as usize;
            jumps_performed += 1;
            if jumps_performed > MAX_JUMPS {
                return Err(anyhow::anyhow!("DNS name parse: too many jumps (possible loop)"));
            }
            continue;
        }
        // 01 and 10 prefixes are not plain labels
        if len_byte & 0xC0 != 0 {
            return Err(anyhow::anyhow!("DNS name parse: unsupported label type {:#04x} at offset {}", len_byte, pos));
        }

        if len_byte == 0 {
            if !jumped {
                *offset = pos + 1;
            }
            break;
        }

        let label_len = len_byte as usize;
        pos += 1;

        if pos + label_len > data.len() {
            return Err(anyhow::anyhow!("DNS name parse: label extends beyond packet"));
        }

        labels.push(data[pos..pos + label_len].to_vec());
        pos += label_len;
    }

    Ok(labels)
}

/// Dotted presentation form. Lossy for non-UTF-8 labels, only used for lookups.
pub fn labels_to_string(labels: &[Vec<u8>]) -> String {
    labels
        .iter()
        .map(|l| String::from_utf8_lossy(l))
        .collect::<Vec<_>>()
        .join(".")
}

/// Parse a DNS name into its dotted form
pub fn parse_name(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    parse_labels(data, offset).map(|labels| labels_to_string(&labels))
}

/// Parse a complete DNS packet from raw bytes
pub fn parse_packet(data: &[u8]) -> anyhow::Result<DnsPacket> {
    if data.len() < 12 {
        return Err(anyhow::anyhow!("DNS packet too short: {} bytes (minimum 12)", data.len()));
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    let ancount = u16::from_be_bytes([data[6], data[7]]);
    let nscount = u16::from_be_bytes([data[8], data[9]]);
    let arcount = u16::from_be_bytes([data[10], data[11]]);

    let header = DnsHeader {
        id,
        rcode: ResponseCode::from((flags & 0xF) as u8),
    };

    let mut offset = 12;

    let mut questions = Vec::new();
    for _ in 0..qdcount {
        let labels = parse_labels(data, &mut offset)?;
        if offset + 4 > data.len() {
            return Err(anyhow::anyhow!("DNS question section truncated"));
        }
        let qtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
        let qclass = DnsClass::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        offset += 4;
        questions.push(DnsQuestion {
            name: labels_to_string(&labels),
            labels,
            qtype,
            qclass,
        });
    }

    let answers = parse_records(data, &mut offset, ancount)?;
    let authorities = parse_records(data, &mut offset, nscount)?;
    let additionals = parse_records(data, &mut offset, arcount)?;

    Ok(DnsPacket {
        header,
        questions,
        answers,
        authorities,
        additionals,
        raw: data.to_vec(),
    })
}

fn parse_records(data: &[u8], offset: &mut usize, count: u16) -> anyhow::Result<Vec<DnsRecord>> {
    let mut records = Vec::new();
    for _ in 0..count {
        let owner = parse_labels(data, offset)?;
        if *offset + 10 > data.len() {
            return Err(anyhow::anyhow!("DNS record truncated at offset {}", offset));
        }
        let rtype = RecordType::from(u16::from_be_bytes([data[*offset], data[*offset + 1]]));
        let rclass = DnsClass::from(u16::from_be_bytes([data[*offset + 2], data[*offset + 3]]));
        let ttl = u32::from_be_bytes([data[*offset + 4], data[*offset + 5], data[*offset + 6], data[*offset + 7]]);
        let rdlength = u16::from_be_bytes([data[*offset + 8], data[*offset + 9]]) as usize;
        *offset += 10;

        if *offset + rdlength > data.len() {
            return Err(anyhow::anyhow!("DNS rdata extends beyond packet"));
        }
        let rdata_offset = *offset;
        let rdata = data[*offset..*offset + rdlength].to_vec();
        *offset += rdlength;

        records.push(DnsRecord {
            owner,
            rtype,
            rclass,
            ttl,
            rdata,
            rdata_offset,
        });
    }
    Ok(records)
}

/// Build a SERVFAIL response from a query packet
pub fn build_servfail(query: &[u8]) -> anyhow::Result<Vec<u8>> {
    if query.len() < 12 {
        return Err(anyhow::anyhow!("Query too short for SERVFAIL"));
    }
    let mut response = query.to_vec();
    // QR=1, TC=0, RCODE=2
    response[2] = (response[2] | 0x80) & 0xFD;
    response[3] = (response[3] & 0xF0) | 0x02;
    // Zero out answer/authority/additional counts
    response[6] = 0; response[7] = 0;
    response[8] = 0; response[9] = 0;
    response[10] = 0; response[11] = 0;
    Ok(response)
}

/// Extract the query name and type from a raw DNS query
pub fn extract_query_info(data: &[u8]) -> anyhow::Result<(String, RecordType)> {
    if data.len() < 12 {
        return Err(anyhow::anyhow!("Query too short"));
    }
    let mut offset = 12;
    let name = parse_name(data, &mut offset)?;
    if offset + 4 > data.len() {
        return Err(anyhow::anyhow!("Query truncated after name"));
    }
    let qtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
    Ok((name, qtype))
}

fn check_label(label: &[u8]) -> anyhow::Result<()> {
    if label.is_empty() || label.len() > 63 {
        return Err(anyhow::anyhow!("DNS name encode: bad label length {}", label.len()));
    }
    Ok(())
}

/// Write a name without compression
fn write_labels(out: &mut Vec<u8>, labels: &[Vec<u8>]) -> anyhow::Result<()> {
    for label in labels {
        check_label(label)?;
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
    Ok(())
}

/// Suffix -> offset table for RFC 1035 §4.1.4 compression on output.
/// Suffixes are matched on exact label bytes.
#[derive(Default)]
struct NameCompressor {
    offsets: HashMap<Labels, u16>,
}

impl NameCompressor {
    fn write(&mut self, out: &mut Vec<u8>, labels: &[Vec<u8>]) -> anyhow::Result<()> {
        for i in 0..labels.len() {
            let suffix = &labels[i..];
            if let Some(&ptr) = self.offsets.get(suffix) {
                out.extend_from_slice(&(0xC000 | ptr).to_be_bytes());
                return Ok(());
            }
            check_label(&labels[i])?;
            // pointers only address the first 16K of the message
            if out.len() < 0x4000 {
                self.offsets.insert(suffix.to_vec(), out.len() as u16);
            }
            out.push(labels[i].len() as u8);
            out.extend_from_slice(&labels[i]);
        }
        out.push(0);
        Ok(())
    }
}

/// Re-encode a parsed packet from its (possibly reordered) sections.
/// The header flags are kept from the original bytes, counts are recomputed.
pub fn encode_packet(packet: &DnsPacket) -> anyhow::Result<Vec<u8>> {
    if packet.raw.len() < 12 {
        return Err(anyhow::anyhow!("Packet too short"));
    }
    let mut out = Vec::with_capacity(packet.raw.len() + 64);
    let mut names = NameCompressor::default();

    out.extend_from_slice(&packet.raw[0..4]);
    for count in [
        packet.questions.len(),
        packet.answers.len(),
        packet.authorities.len(),
        packet.additionals.len(),
    ] {
        out.extend_from_slice(&u16::try_from(count)?.to_be_bytes());
    }

    for q in &packet.questions {
        names.write(&mut out, &q.labels)?;
        out.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
        out.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
    }

    for record in packet.answers.iter()
        .chain(packet.authorities.iter())
        .chain(packet.additionals.iter())
    {
        encode_record(&mut out, &mut names, record, &packet.raw)?;
    }

    Ok(out)
}

fn encode_record(
    out: &mut Vec<u8>,
    names: &mut NameCompressor,
    record: &DnsRecord,
    raw: &[u8],
) -> anyhow::Result<()> {
    names.write(out, &record.owner)?;
    out.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
    out.extend_from_slice(&record.rclass.to_u16().to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let len_pos = out.len();
    out.extend_from_slice(&[0, 0]);
    let rdata_start = out.len();

    // Names inside rdata may point anywhere in the original message,
    // so they are expanded from `raw` and written again.
    let rdata = &record.rdata;
    let base = record.rdata_offset;
    match record.rtype {
        RecordType::CNAME
        | RecordType::NS
        | RecordType::PTR
        | RecordType::MB
        | RecordType::MG
        | RecordType::MR => {
            let (name, used) = rdata_labels(raw, base, rdata.len(), 0)?;
            if used != rdata.len() {
                return Err(anyhow::anyhow!("DNS {} rdata has trailing bytes", record.rtype.name()));
            }
            names.write(out, &name)?;
        }
        RecordType::MX if rdata.len() >= 3 => {
            out.extend_from_slice(&rdata[..2]);
            let (name, _) = rdata_labels(raw, base, rdata.len(), 2)?;
            names.write(out, &name)?;
        }
        RecordType::SRV if rdata.len() >= 7 => {
            // RFC 2782: target is never compressed
            out.extend_from_slice(&rdata[..6]);
            let (name, _) = rdata_labels(raw, base, rdata.len(), 6)?;
            write_labels(out, &name)?;
        }
        // two names, then SOA's fixed fields (MINFO has none)
        RecordType::SOA | RecordType::MINFO => {
            let (first, used) = rdata_labels(raw, base, rdata.len(), 0)?;
            let (second, used) = rdata_labels(raw, base, rdata.len(), used)?;
            names.write(out, &first)?;
            names.write(out, &second)?;
            out.extend_from_slice(&rdata[used..]);
        }
        _ => out.extend_from_slice(rdata),
    }

    let rdlength = u16::try_from(out.len() - rdata_start)?;
    out[len_pos..len_pos + 2].copy_from_slice(&rdlength.to_be_bytes());
    Ok(())
}

/// Parse a name located `skip` bytes into an rdata block. Returns the labels
/// and the rdata-relative offset just past the name.
fn rdata_labels(raw: &[u8], base: usize, rdlength: usize, skip: usize) -> anyhow::Result<(Labels, usize)> {
    let mut offset = base + skip;
    let labels = parse_labels(raw, &mut offset)?;
    let used = offset - base;
    if used > rdlength {
        return Err(anyhow::anyhow!("DNS rdata name extends beyond rdlength"));
    }
    Ok((labels, used))
}
