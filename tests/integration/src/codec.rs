//! Wire-level codec scenarios, end to end over the byte forms.

use bytes::Bytes;
use shoal_protocol::{decode_from_bytes, encode_to_bytes, Decoder, Resp};

#[tokio::test]
async fn set_command_bytes_round_trip() {
    let wire = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
    let decoded = decode_from_bytes(wire).await.unwrap();
    assert_eq!(
        decoded,
        Resp::array(vec![
            Resp::bulk("SET"),
            Resp::bulk("key"),
            Resp::bulk("value"),
        ])
    );
    assert_eq!(encode_to_bytes(&decoded).await.unwrap(), wire);
}

#[tokio::test]
async fn large_negative_integer() {
    let decoded = decode_from_bytes(b":-1234567890123\r\n").await.unwrap();
    assert_eq!(decoded, Resp::Integer(Bytes::from_static(b"-1234567890123")));
    assert_eq!(decoded.as_int().unwrap(), -1234567890123);
}

#[tokio::test]
async fn null_bulk_is_distinct_from_empty() {
    let null = decode_from_bytes(b"$-1\r\n").await.unwrap();
    let empty = decode_from_bytes(b"$0\r\n\r\n").await.unwrap();
    assert_eq!(null, Resp::null_bulk());
    assert_eq!(empty, Resp::bulk(""));
    assert_ne!(null, empty);
}

#[tokio::test]
async fn null_array_then_simple_string_across_two_decodes() {
    let mut dec = Decoder::new(&b"*-1\r\n+OK\r\n"[..]);
    assert_eq!(dec.decode().await.unwrap(), Resp::null_array());
    assert_eq!(dec.decode().await.unwrap(), Resp::simple("OK"));
}
