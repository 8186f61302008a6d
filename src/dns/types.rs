/// DNS record types
///
/// Types whose rdata holds a (possibly compressed) domain name are listed
/// explicitly so the encoder can rewrite those names. Everything else is
/// carried as `Unknown` and copied byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    MB,
    MG,
    MR,
    PTR,
    MINFO,
    MX,
    TXT,
    AAAA,
    SRV,
    Unknown(u16),
}

impl From<u16> for RecordType {
    fn from(v: u16) -> Self {
        match v {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            7 => RecordType::MB,
            8 => RecordType::MG,
            9 => RecordType::MR,
            12 => RecordType::PTR,
            14 => RecordType::MINFO,
            15 => RecordType::MX,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            other => RecordType::Unknown(other),
        }
    }
}

impl RecordType {
    pub fn to_u16(&self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::MB => 7,
            RecordType::MG => 8,
            RecordType::MR => 9,
            RecordType::PTR => 12,
            RecordType::MINFO => 14,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::Unknown(v) => *v,
        }
    }

    pub fn name(&self) -> String {
        match self {
            RecordType::Unknown(v) => format!("TYPE{}", v),
            known => format!("{:?}", known),
        }
    }

    /// True for A and AAAA, the records the weighted balancer promotes
    pub fn is_address(&self) -> bool {
        matches!(self, RecordType::A | RecordType::AAAA)
    }
}

/// DNS response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl From<u8> for ResponseCode {
    fn from(v: u8) -> Self {
        match v {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormErr,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImp,
            5 => ResponseCode::Refused,
            other => ResponseCode::Other(other),
        }
    }
}

/// DNS class, only IN gets a name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsClass {
    IN,
    Other(u16),
}

impl From<u16> for DnsClass {
    fn from(v: u16) -> Self {
        match v {
            1 => DnsClass::IN,
            other => DnsClass::Other(other),
        }
    }
}

impl DnsClass {
    pub fn to_u16(&self) -> u16 {
        match self {
            DnsClass::IN => 1,
            DnsClass::Other(v) => *v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_codes() {
        assert_eq!(RecordType::from(28), RecordType::AAAA);
        assert_eq!(RecordType::from(14), RecordType::MINFO);
        assert_eq!(RecordType::from(4242).to_u16(), 4242);
        assert_eq!(RecordType::from(4242).name(), "TYPE4242");
        assert_eq!(RecordType::CNAME.name(), "CNAME");
        assert_eq!(DnsClass::from(3).to_u16(), 3);
        assert_eq!(ResponseCode::from(9), ResponseCode::Other(9));
    }

    #[test]
    fn test_address_types() {
        assert!(RecordType::A.is_address());
        assert!(RecordType::AAAA.is_address());
        assert!(!RecordType::CNAME.is_address());
        assert!(!RecordType::MX.is_address());
    }
}
