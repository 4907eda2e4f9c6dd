//! Codec filaire de l'API RouterOS.
//!
//! Chaque mot est préfixé par sa longueur en encodage variable :
//!   len < 0x80        -> 1 octet
//!   len < 0x4000      -> 2 octets, masque 0x8000
//!   len < 0x200000    -> 3 octets, masque 0xC00000
//!   len < 0x10000000  -> 4 octets, masque 0xE0000000
//!   sinon             -> 0xF0 + longueur sur 4 octets
//!
//! Une phrase est une suite de mots terminée par un mot de longueur zéro.
//! Requête : mot de commande ("/system/resource/print") + attributs
//! "=clé=valeur". Réponse : phrases "!re" (un enregistrement), "!done"
//! (fin), "!trap" (erreur), "!fatal" (fermeture).

use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Garde-fou contre des longueurs aberrantes sur le fil
const MAX_WORD_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("word of {0} bytes exceeds protocol maximum")]
    WordTooLong(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Phrase de réponse classifiée
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Data(HashMap<String, String>),
    Done,
    Trap { message: String },
    Fatal(String),
}

pub fn encode_length(len: u32) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len < 0x4000 {
        let v = len | 0x8000;
        vec![(v >> 8) as u8, v as u8]
    } else if len < 0x20_0000 {
        let v = len | 0xC0_0000;
        vec![(v >> 16) as u8, (v >> 8) as u8, v as u8]
    } else if len < 0x1000_0000 {
        let v = len | 0xE000_0000;
        vec![(v >> 24) as u8, (v >> 16) as u8, (v >> 8) as u8, v as u8]
    } else {
        vec![
            0xF0,
            (len >> 24) as u8,
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
        ]
    }
}

pub async fn read_length<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, ProtocolError> {
    let first = r.read_u8().await?;
    if first & 0x80 == 0 {
        return Ok(first as u32);
    }
    let (mut value, extra) = if first & 0xC0 == 0x80 {
        ((first & 0x3F) as u32, 1)
    } else if first & 0xE0 == 0xC0 {
        ((first & 0x1F) as u32, 2)
    } else if first & 0xF0 == 0xE0 {
        ((first & 0x0F) as u32, 3)
    } else if first == 0xF0 {
        (0, 4)
    } else {
        return Err(ProtocolError::Malformed(format!(
            "reserved length prefix 0x{first:02x}"
        )));
    };
    for _ in 0..extra {
        value = (value << 8) | r.read_u8().await? as u32;
    }
    Ok(value)
}

pub async fn write_word<W: AsyncWrite + Unpin>(w: &mut W, word: &str) -> Result<(), ProtocolError> {
    let bytes = word.as_bytes();
    if bytes.len() > MAX_WORD_LEN {
        return Err(ProtocolError::WordTooLong(bytes.len()));
    }
    w.write_all(&encode_length(bytes.len() as u32)).await?;
    w.write_all(bytes).await?;
    Ok(())
}

pub async fn write_sentence<W: AsyncWrite + Unpin>(
    w: &mut W,
    words: &[&str],
) -> Result<(), ProtocolError> {
    for word in words {
        write_word(w, word).await?;
    }
    w.write_all(&[0]).await?;
    w.flush().await?;
    Ok(())
}

/// Lit une phrase complète. Une phrase vide (terminateur immédiat) donne
/// un vecteur vide, à ignorer par l'appelant.
pub async fn read_sentence<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<String>, ProtocolError> {
    let mut words = Vec::new();
    loop {
        let len = read_length(r).await? as usize;
        if len == 0 {
            break;
        }
        if len > MAX_WORD_LEN {
            return Err(ProtocolError::Malformed(format!(
                "announced word length {len} exceeds maximum"
            )));
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        words.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(words)
}

pub fn classify_reply(words: &[String]) -> Result<Reply, ProtocolError> {
    let Some((head, rest)) = words.split_first() else {
        return Err(ProtocolError::Malformed("empty sentence".into()));
    };
    match head.as_str() {
        "!re" => Ok(Reply::Data(parse_attributes(rest))),
        "!done" => Ok(Reply::Done),
        "!trap" => {
            let attrs = parse_attributes(rest);
            Ok(Reply::Trap {
                message: attrs
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| "unknown error".into()),
            })
        }
        "!fatal" => Ok(Reply::Fatal(rest.first().cloned().unwrap_or_default())),
        other => Err(ProtocolError::Malformed(format!(
            "unexpected reply word: {other}"
        ))),
    }
}

/// Extrait les attributs "=clé=valeur" d'une phrase ; les mots de contrôle
/// (".tag=...") sont ignorés.
pub fn parse_attributes(words: &[String]) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for word in words {
        let Some(body) = word.strip_prefix('=') else {
            continue;
        };
        match body.split_once('=') {
            Some((key, value)) => {
                attrs.insert(key.to_string(), value.to_string());
            }
            None => {
                attrs.insert(body.to_string(), String::new());
            }
        }
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn decode(encoded: &[u8]) -> u32 {
        let mut cursor = Cursor::new(encoded.to_vec());
        read_length(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn length_roundtrip_at_boundaries() {
        for len in [
            0u32,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x1F_FFFF,
            0x20_0000,
            0xFFF_FFFF,
            0x1000_0000,
        ] {
            let encoded = encode_length(len);
            assert_eq!(decode(&encoded).await, len, "len={len:#x}");
        }
        assert_eq!(encode_length(0x7F).len(), 1);
        assert_eq!(encode_length(0x80).len(), 2);
        assert_eq!(encode_length(0x4000).len(), 3);
        assert_eq!(encode_length(0x20_0000).len(), 4);
        assert_eq!(encode_length(0x1000_0000).len(), 5);
    }

    #[tokio::test]
    async fn reserved_prefix_rejected() {
        let mut cursor = Cursor::new(vec![0xF8u8, 0, 0, 0, 0]);
        assert!(matches!(
            read_length(&mut cursor).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn sentence_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_sentence(&mut client, &["/login", "=name=api", "=password=s3cret"])
            .await
            .unwrap();
        let words = read_sentence(&mut server).await.unwrap();
        assert_eq!(words, vec!["/login", "=name=api", "=password=s3cret"]);
    }

    #[test]
    fn classify_replies() {
        let data = vec!["!re".to_string(), "=cpu-load=12".to_string()];
        match classify_reply(&data).unwrap() {
            Reply::Data(attrs) => assert_eq!(attrs.get("cpu-load").unwrap(), "12"),
            other => panic!("unexpected reply: {other:?}"),
        }

        let trap = vec![
            "!trap".to_string(),
            "=message=invalid user name or password (6)".to_string(),
        ];
        match classify_reply(&trap).unwrap() {
            Reply::Trap { message } => assert_eq!(message, "invalid user name or password (6)"),
            other => panic!("unexpected reply: {other:?}"),
        }

        assert_eq!(
            classify_reply(&["!done".to_string()]).unwrap(),
            Reply::Done
        );
        assert!(classify_reply(&["bogus".to_string()]).is_err());
        assert!(classify_reply(&[]).is_err());
    }

    #[test]
    fn attribute_parsing_edge_cases() {
        let words = vec![
            "=name=ether1".to_string(),
            "=comment=".to_string(),
            "=running".to_string(),
            ".tag=42".to_string(),
            "=target=vpn=site-a".to_string(), // valeur contenant un '='
        ];
        let attrs = parse_attributes(&words);
        assert_eq!(attrs.get("name").unwrap(), "ether1");
        assert_eq!(attrs.get("comment").unwrap(), "");
        assert_eq!(attrs.get("running").unwrap(), "");
        assert!(!attrs.contains_key(".tag"));
        assert_eq!(attrs.get("target").unwrap(), "vpn=site-a");
    }
}
