use std::{io::Cursor, net::TcpListener, thread};

use log::LevelFilter;
use pof_rs::{
    networking::{
        codec::{
            decode_packet, encode_packet, ping_frame, read_frame, registry, type_id_of, CodecError,
            Envelope, Frame, Packet,
        },
        handshake::{accept_stream, dial, HandshakeOutcome},
        messages::{PeerEntry, PeerListMessage},
        peer::PeerError,
    },
    sync::messages::{BlockMessage, RequestMessage, StatusMessage},
    txpool::messages::TransactionMessage,
    types::{
        crypto_primitives::{keccak256, Keypair},
        data_types::ChainID,
    },
};

mod common;

use common::{
    cluster::CHAIN_ID,
    keys::{self, keypair},
    logging::{log_step, setup_logger},
    token_app::mint,
};

type HandshakeResult = Result<HandshakeOutcome, PeerError>;

/// Tests the framing of packets: type ids, compression, and the errors a malformed frame produces.
#[test]
fn codec_test() {
    setup_logger(LevelFilter::Info);

    // 1. Every registered packet type has its own id.
    log_step(1, "Checking the type registry.");
    assert_eq!(registry().len(), 13);
    assert_eq!(registry().get(&StatusMessage::type_id()), Some(&StatusMessage::TYPE_NAME));
    assert_eq!(StatusMessage::type_id(), type_id_of("pof_rs::sync::StatusMessage"));

    // 2. A status survives a frame, and is recognized by its type.
    log_step(2, "Encoding and decoding a status.");
    let status = StatusMessage {
        height: 42,
        last_hash: keccak256(b"tip"),
    };
    let frame = encode_packet(&status);
    let envelope = Envelope::decode(&frame).unwrap();
    assert!(envelope.is::<StatusMessage>());
    assert!(!envelope.is::<RequestMessage>());
    assert_eq!(envelope.type_name(), StatusMessage::TYPE_NAME);
    assert_eq!(envelope.parse::<StatusMessage>().unwrap(), status);
    assert!(matches!(
        envelope.parse::<RequestMessage>(),
        Err(CodecError::UnexpectedType { .. })
    ));

    // 3. Transactions and peer lists go through the same framing.
    log_step(3, "Encoding transactions and a peer list.");
    let (tx, signature) = mint(CHAIN_ID, &keys::admin(), keys::recipient(), 5);
    let message = TransactionMessage {
        transactions: vec![tx.clone()],
        signatures: vec![signature],
    };
    let decoded: TransactionMessage = decode_packet(&encode_packet(&message)).unwrap();
    assert_eq!(decoded.transactions, vec![tx]);
    assert_eq!(decoded.signatures.len(), 1);

    let peers = PeerListMessage {
        peers: vec![PeerEntry {
            address: "127.0.0.1:4000".to_string(),
            public_key: keypair(0xC0, 1).public(),
        }],
    };
    let decoded: PeerListMessage = decode_packet(&encode_packet(&peers)).unwrap();
    assert_eq!(decoded.peers[0].address, "127.0.0.1:4000");

    // 4. Malformed frames are refused.
    log_step(4, "Decoding malformed frames.");
    assert!(matches!(Envelope::decode(&frame[..5]), Err(CodecError::Truncated)));
    assert!(matches!(
        Envelope::decode(&frame[..frame.len() - 1]),
        Err(CodecError::Truncated)
    ));
    let mut unknown = frame.clone();
    unknown[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    assert!(matches!(
        Envelope::decode(&unknown),
        Err(CodecError::UnknownType(0xDEAD_BEEF))
    ));

    // 5. A stream interleaves pings with whole frames.
    log_step(5, "Reading frames from a stream.");
    let request = encode_packet(&RequestMessage { height: 10, count: 10 });
    let blocks = encode_packet(&BlockMessage { blocks: Vec::new() });
    let mut stream = Vec::new();
    stream.extend_from_slice(&ping_frame());
    stream.extend_from_slice(&request);
    stream.extend_from_slice(&blocks);
    let mut reader = Cursor::new(stream);
    assert!(matches!(read_frame(&mut reader).unwrap(), Frame::Ping));
    match read_frame(&mut reader).unwrap() {
        Frame::Packet(bytes) => assert_eq!(bytes, request),
        Frame::Ping => panic!("expected a packet"),
    }
    match read_frame(&mut reader).unwrap() {
        Frame::Packet(bytes) => {
            let message: BlockMessage = decode_packet(&bytes).unwrap();
            assert!(message.blocks.is_empty());
        }
        Frame::Ping => panic!("expected a packet"),
    }
    assert!(matches!(read_frame(&mut reader), Err(CodecError::Io(_))));
}

/// Dial a fresh listener and return the outcome on both ends.
fn connect_pair(
    dialer: &Keypair,
    dialer_chain: ChainID,
    listener_key: &Keypair,
    listener_chain: ChainID,
) -> (HandshakeResult, HandshakeResult) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let listener_key = listener_key.clone();
    let acceptor = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        accept_stream(&stream, &listener_key, listener_chain, "listener")
    });
    let outcome = dial(&address, dialer, dialer_chain, "dialer").map(|(_, outcome)| outcome);
    (outcome, acceptor.join().unwrap())
}

/// Tests the mutual challenge both ends of a new connection answer.
#[test]
fn handshake_test() {
    setup_logger(LevelFilter::Info);

    // 1. Two keypairs on the same chain learn each other's public key and bind address.
    log_step(1, "Handshaking between two peers.");
    let (dialer, listener_key) = (keypair(0xD0, 1), keypair(0xD0, 2));
    let (outcome, accepted) = connect_pair(&dialer, CHAIN_ID, &listener_key, CHAIN_ID);
    let outcome = outcome.unwrap();
    let accepted = accepted.unwrap();
    assert_eq!(outcome.public_key, listener_key.public());
    assert_eq!(outcome.bind_address, "listener");
    assert_eq!(accepted.public_key, dialer.public());
    assert_eq!(accepted.bind_address, "dialer");

    // 2. Peers on different chains refuse each other.
    log_step(2, "Handshaking across chains.");
    let (outcome, accepted) =
        connect_pair(&dialer, CHAIN_ID, &listener_key, ChainID::new(CHAIN_ID.int() + 1));
    assert!(matches!(outcome, Err(PeerError::InvalidChainID { .. })));
    assert!(matches!(accepted, Err(PeerError::InvalidChainID { .. })));

    // 3. A peer that reaches itself notices.
    log_step(3, "Handshaking with itself.");
    let (outcome, accepted) = connect_pair(&dialer, CHAIN_ID, &dialer, CHAIN_ID);
    assert!(matches!(outcome, Err(PeerError::SelfConnection)));
    assert!(matches!(accepted, Err(PeerError::SelfConnection)));
}

