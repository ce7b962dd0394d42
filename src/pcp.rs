//! PCP client message encoding and decoding.
//!
//! Wire layout per [RFC 6887]. Covers the ANNOUNCE and MAP opcodes a port
//! mapping client needs; PCP options are not used. Putting these bytes on
//! the network is the network gateway's job.
//!
//! [RFC 6887]: https://datatracker.ietf.org/doc/html/rfc6887

use std::net::{Ipv4Addr, Ipv6Addr};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Port the gateway listens on for PCP requests, shared with NAT-PMP.
pub const SERVER_PORT: u16 = 5351;

/// A fresh nonce for a new mapping.
///
/// Renewals and deletions of the mapping must reuse it.
pub fn random_nonce() -> [u8; 12] {
    use rand::RngCore;
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// PCP protocol version.
///
/// Version 1 was never deployed; 0 is NAT-PMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// Version described by RFC 6887.
    Pcp = 2,
}

/// Operation requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Probe for server presence and epoch.
    Announce = 0,
    /// Create or refresh an inbound mapping.
    Map = 1,
}

/// Transport protocol of a requested mapping, by IANA protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MapProtocol {
    /// TCP mapping.
    Tcp = 6,
    /// UDP mapping.
    Udp = 17,
}

/// Error result codes a server can answer with.
///
/// See [RFC 6887 Result Codes](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4);
/// code 0 is success and never surfaces as an error.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    derive_more::Display,
    thiserror::Error,
)]
#[repr(u8)]
pub enum ErrorCode {
    /// The server does not speak this protocol version.
    #[display("sent version is not supported")]
    UnsupportedVersion = 1,
    /// The operation is disabled for this client.
    #[display("operation not authorized")]
    NotAuthorized = 2,
    /// The request could not be parsed.
    #[display("could not parse the request")]
    MalformedRequest = 3,
    /// The server does not implement the opcode.
    #[display("opcode is not supported")]
    UnsupportedOpcode = 4,
    /// A mandatory-to-process option is not supported.
    #[display("option is not supported")]
    UnsupportedOption = 5,
    /// An option appears too often or has an invalid length.
    #[display("option could not be parsed")]
    MalformedOption = 6,
    /// The server or the device it controls has no working connectivity.
    #[display("spurious network failure")]
    NetworkFailure = 7,
    /// Not enough resources to complete the operation right now.
    #[display("not enough resources for this request")]
    NoResources = 8,
    /// The transport protocol is not handled by this server.
    #[display("unsupported protocol")]
    UnsupportedProtocol = 9,
    /// The mapping would exceed the subscriber's quota.
    #[display("quota exceeded")]
    UserExceededQuota = 10,
    /// The suggested external address or port cannot be provided.
    #[display("requested external address cannot be provided")]
    CannotProvideExternal = 11,
    /// The packet's source address does not match the declared client
    /// address.
    #[display("sender and declared ip do not match")]
    AddressMismatch = 12,
    /// The server could not create the requested filters.
    #[display("excessive remote peers in filter option")]
    ExcessiveRemotePeers = 13,
}

/// Errors produced when decoding a [`Response`].
#[derive(Debug, PartialEq, Eq, derive_more::Display, thiserror::Error)]
pub enum Error {
    /// Response is too short, too long or otherwise malformed.
    #[display("response is malformed")]
    Malformed,
    /// The response indicator bit is not present.
    #[display("packet is not a response")]
    NotAResponse,
    /// The opcode is none of the defined ones.
    #[display("invalid opcode received")]
    InvalidOpcode,
    /// The version is not PCP's.
    #[display("invalid version received")]
    InvalidVersion,
    /// The result code is none of the defined ones.
    #[display("invalid result code received")]
    InvalidResultCode,
    /// The opcode-specific payload could not be decoded.
    #[display("invalid opcode data received")]
    InvalidOpcodeData,
    /// The server answered with an error result code.
    #[display("server refused the request: {_0}")]
    Refused(#[source] ErrorCode),
}

/// Payload specific to the [`Opcode`] of a message.
#[derive(Debug, PartialEq, Eq)]
pub enum OpcodeData {
    /// ANNOUNCE carries no payload.
    Announce,
    /// MAP payload.
    Map(MapData),
}

impl OpcodeData {
    fn opcode(&self) -> Opcode {
        match self {
            OpcodeData::Announce => Opcode::Announce,
            OpcodeData::Map(_) => Opcode::Map,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            OpcodeData::Announce => {}
            OpcodeData::Map(map_data) => buf.extend_from_slice(&map_data.encode()),
        }
    }

    fn decode(opcode: Opcode, buf: &[u8]) -> Result<Self, Error> {
        match opcode {
            Opcode::Announce => Ok(OpcodeData::Announce),
            Opcode::Map => MapData::decode(buf).map(OpcodeData::Map),
        }
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        match opcode {
            Opcode::Announce => OpcodeData::Announce,
            Opcode::Map => OpcodeData::Map(MapData::random(rng)),
        }
    }
}

/// Payload of a MAP request or response.
#[derive(Debug, PartialEq, Eq)]
pub struct MapData {
    /// Random value matching responses to their request, and later
    /// modifications to the mapping they refer to.
    pub nonce: [u8; 12],
    /// Protocol of the mapping.
    pub protocol: MapProtocol,
    /// Local port of the mapping.
    pub local_port: u16,
    /// External port; the suggested one in requests, the assigned one in
    /// responses. 0 means no preference.
    pub external_port: u16,
    /// External address, IPv4-mapped when it is an IPv4 address. All zeros
    /// for no preference.
    pub external_address: Ipv6Addr,
}

impl MapData {
    /// Size of the MAP-specific payload.
    pub const ENCODED_SIZE: usize = // parts:
        12 + // nonce
        1 + // protocol
        3 + // reserved
        2 + // local port
        2 + // external port
        16; // external address

    fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let MapData {
            nonce,
            protocol,
            local_port,
            external_port,
            external_address,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0..12].copy_from_slice(nonce);
        buf[12] = (*protocol).into();
        // buf[13..16] reserved
        buf[16..18].copy_from_slice(&local_port.to_be_bytes());
        buf[18..20].copy_from_slice(&external_port.to_be_bytes());
        buf[20..].copy_from_slice(&external_address.octets());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(Error::Malformed);
        }
        let nonce = buf[..12].try_into().expect("slice has the right size");
        let protocol = buf[12].try_into().map_err(|_| Error::InvalidOpcodeData)?;
        // buf[13..16] reserved
        let local_port = u16::from_be_bytes(buf[16..18].try_into().expect("slice has the right size"));
        let external_port =
            u16::from_be_bytes(buf[18..20].try_into().expect("slice has the right size"));
        let external_addr_bytes: [u8; 16] =
            buf[20..Self::ENCODED_SIZE].try_into().expect("slice has the right size");
        Ok(MapData {
            nonce,
            protocol,
            local_port,
            external_port,
            external_address: external_addr_bytes.into(),
        })
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(rng: &mut R) -> Self {
        let octets: [u8; 16] = rng.gen();
        MapData {
            nonce: rng.gen(),
            protocol: MapProtocol::Udp,
            local_port: rng.gen(),
            external_port: rng.gen(),
            external_address: octets.into(),
        }
    }
}

/// A PCP request.
///
/// See [RFC 6887 Request Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.1).
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    /// Requested lifetime in seconds.
    pub lifetime_seconds: u32,
    /// Address of the client, IPv4-mapped when it is an IPv4 address.
    pub client_addr: Ipv6Addr,
    /// Payload of the request's opcode.
    pub opcode_data: OpcodeData,
}

impl Request {
    /// Size of the shared request header.
    pub const HEADER_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        4 + // lifetime
        16; // client address

    /// An ANNOUNCE probe for the server at the default port.
    pub fn announce(client_addr: Ipv4Addr) -> Request {
        Request {
            // announce requires a zero lifetime
            lifetime_seconds: 0,
            client_addr: client_addr.to_ipv6_mapped(),
            opcode_data: OpcodeData::Announce,
        }
    }

    /// A MAP request for `local_port`, renewing with the same `nonce`.
    pub fn mapping(
        nonce: [u8; 12],
        protocol: MapProtocol,
        local_port: u16,
        local_addr: Ipv4Addr,
        preferred_external_port: Option<u16>,
        preferred_external_addr: Option<Ipv4Addr>,
        lifetime_seconds: u32,
    ) -> Request {
        Request {
            lifetime_seconds,
            client_addr: local_addr.to_ipv6_mapped(),
            opcode_data: OpcodeData::Map(MapData {
                nonce,
                protocol,
                local_port,
                // 0 signals no preference
                external_port: preferred_external_port.unwrap_or_default(),
                external_address: preferred_external_addr
                    .unwrap_or(Ipv4Addr::UNSPECIFIED)
                    .to_ipv6_mapped(),
            }),
        }
    }

    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        let Request {
            lifetime_seconds,
            client_addr,
            opcode_data,
        } = self;
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + MapData::ENCODED_SIZE);
        buf.push(Version::Pcp.into());
        buf.push(opcode_data.opcode().into());
        buf.push(0); // reserved
        buf.push(0); // reserved
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        buf.extend_from_slice(&client_addr.octets());
        opcode_data.encode_into(&mut buf);
        buf
    }

    #[cfg(test)]
    #[track_caller]
    fn decode(buf: &[u8]) -> Self {
        let _version: Version = buf[0].try_into().unwrap();
        let opcode: Opcode = buf[1].try_into().unwrap();
        // buf[2..4] reserved
        let lifetime_seconds = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let client_addr_bytes: [u8; 16] = buf[8..24].try_into().unwrap();
        let opcode_data = OpcodeData::decode(opcode, &buf[24..]).unwrap();
        Request {
            lifetime_seconds,
            client_addr: client_addr_bytes.into(),
            opcode_data,
        }
    }
}

/// A successful PCP response.
///
/// See [RFC 6887 Response Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.2).
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    /// Lifetime in seconds this response can be assumed valid for.
    pub lifetime_seconds: u32,
    /// Epoch time of the server.
    pub epoch_time: u32,
    /// Payload of the response's opcode.
    pub data: OpcodeData,
}

impl Response {
    /// Size of the shared response header.
    pub const HEADER_SIZE: usize = // parts:
        1 + // version
        1 + // opcode with the response indicator
        1 + // reserved
        1 + // result code
        4 + // lifetime
        4 + // epoch time
        12; // reserved

    /// Maximum size of a PCP packet.
    pub const MAX_SIZE: usize = 1100;

    /// Indicator ORd into the [`Opcode`] to mark a response packet.
    pub const INDICATOR: u8 = 1u8 << 7;

    /// Decode a response, validating version, indicator and result code.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::HEADER_SIZE || buf.len() > Self::MAX_SIZE {
            return Err(Error::Malformed);
        }
        let _version: Version = buf[0].try_into().map_err(|_| Error::InvalidVersion)?;
        let opcode = buf[1];
        if opcode & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::NotAResponse);
        }
        let opcode: Opcode = (opcode & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode)?;

        // buf[2] reserved
        match buf[3] {
            0 => {}
            code => {
                let code: ErrorCode = code.try_into().map_err(|_| Error::InvalidResultCode)?;
                return Err(Error::Refused(code));
            }
        }

        let lifetime_seconds =
            u32::from_be_bytes(buf[4..8].try_into().expect("slice has the right len"));
        let epoch_time = u32::from_be_bytes(buf[8..12].try_into().expect("slice has the right len"));
        // buf[12..24] reserved

        let data = OpcodeData::decode(opcode, &buf[24..])?;
        Ok(Response {
            lifetime_seconds,
            epoch_time,
            data,
        })
    }

    #[cfg(test)]
    fn encode(&self) -> Vec<u8> {
        let Response {
            lifetime_seconds,
            epoch_time,
            data,
        } = self;
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + MapData::ENCODED_SIZE);
        buf.push(Version::Pcp.into());
        let opcode: u8 = data.opcode().into();
        buf.push(Self::INDICATOR | opcode);
        buf.push(0); // reserved
        buf.push(0); // success
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        buf.extend_from_slice(&[0; 12]); // reserved
        data.encode_into(&mut buf);
        buf
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        Response {
            lifetime_seconds: rng.gen(),
            epoch_time: rng.gen(),
            data: OpcodeData::random(opcode, rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_encode_decode_announce_request() {
        let request = Request::announce(Ipv4Addr::new(192, 0, 2, 7));
        let encoded = request.encode();
        assert_eq!(encoded.len(), Request::HEADER_SIZE);
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_map_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::mapping(
            random_nonce(),
            MapProtocol::Udp,
            gen.gen(),
            Ipv4Addr::new(192, 0, 2, 7),
            None,
            None,
            gen.gen(),
        );
        let encoded = request.encode();
        assert_eq!(encoded.len(), Request::HEADER_SIZE + MapData::ENCODED_SIZE);
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_map_response() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let response = Response::random(Opcode::Map, &mut gen);
        let encoded = response.encode();
        assert_eq!(Response::decode(&encoded), Ok(response));
    }

    #[test]
    fn test_decode_known_response_vector() {
        // test vector carried over from the tailscale implementation
        let encoded = [
            2, 129, 0, 0, 0, 0, 28, 32, 0, 2, 155, 237, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 129,
            112, 9, 24, 241, 208, 251, 45, 157, 76, 10, 188, 17, 0, 0, 0, 4, 210, 4, 210, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 255, 255, 135, 180, 175, 246,
        ];
        let response = Response::decode(&encoded).unwrap();
        assert_eq!(&response.encode(), &encoded);
    }

    #[test]
    fn test_decode_error_result_code() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let mut encoded = Response::random(Opcode::Map, &mut gen).encode();
        encoded[3] = ErrorCode::NoResources.into();
        assert_eq!(
            Response::decode(&encoded),
            Err(Error::Refused(ErrorCode::NoResources))
        );
    }
}
