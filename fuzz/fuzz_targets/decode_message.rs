//! Fuzz harness for the inbound decoding path.
//!
//! Arbitrary bytes go through the one-shot decoder, the streaming decoder (fed
//! in two pieces at a fuzzer-chosen split) and message unframing. None of them
//! may panic, and the two decoders must agree on well-formed input.

#![no_main]
use ldap_client_core::ber::{self, DecodeLimits};
use ldap_client_core::message::LdapMessage;
use ldap_client_core::stream::StreamDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let limits = DecodeLimits {
        max_element_size: 64 * 1024,
        max_depth: 32,
    };
    let whole = ber::decode(data, &limits);
    let _ = LdapMessage::decode(data, &limits);

    let split = data.first().map_or(0, |b| *b as usize).min(data.len());
    let mut decoder = StreamDecoder::new(limits);
    let mut buffer = data[..split].to_vec();
    let streamed = match decoder.decode(&buffer) {
        Ok((Some(element), consumed)) => Some(Ok((element, consumed))),
        Ok((None, consumed)) => {
            buffer.drain(..consumed);
            buffer.extend_from_slice(&data[split..]);
            match decoder.decode(&buffer) {
                Ok((Some(element), more)) => Some(Ok((element, consumed + more))),
                Ok((None, _)) => None,
                Err(e) => Some(Err(e)),
            }
        }
        Err(e) => Some(Err(e)),
    };

    if let (Ok((element, consumed)), Some(Ok((streamed, streamed_consumed)))) = (&whole, &streamed) {
        assert_eq!(element, streamed);
        assert_eq!(consumed, streamed_consumed);
    }
});
