/*!
Encodage mot/phrase côté équipement simulé

Le stub n'a besoin que des formes courtes du préfixe de longueur : les
échanges de test restent bien en dessous de 16 Ko par mot.
*/

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn read_sentence<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<String>> {
    let mut words = Vec::new();
    loop {
        let len = read_length(r).await?;
        if len == 0 {
            break;
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        words.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(words)
}

pub async fn write_sentence<W: AsyncWrite + Unpin>(w: &mut W, words: &[&str]) -> Result<()> {
    for word in words {
        write_length(w, word.len()).await?;
        w.write_all(word.as_bytes()).await?;
    }
    w.write_all(&[0]).await?;
    w.flush().await?;
    Ok(())
}

async fn read_length<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize> {
    let first = r.read_u8().await?;
    if first & 0x80 == 0 {
        Ok(first as usize)
    } else if first & 0xC0 == 0x80 {
        let second = r.read_u8().await?;
        Ok((((first & 0x3F) as usize) << 8) | second as usize)
    } else {
        bail!("length form 0x{first:02x} not supported by the stub");
    }
}

async fn write_length<W: AsyncWrite + Unpin>(w: &mut W, len: usize) -> Result<()> {
    if len < 0x80 {
        w.write_all(&[len as u8]).await?;
    } else if len < 0x4000 {
        let v = (len as u16) | 0x8000;
        w.write_all(&v.to_be_bytes()).await?;
    } else {
        bail!("word of {len} bytes too long for the stub");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sentence_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_sentence(&mut client, &["!re", "=name=ether1", "=rx-byte=1000"])
            .await
            .unwrap();
        let words = read_sentence(&mut server).await.unwrap();
        assert_eq!(words, vec!["!re", "=name=ether1", "=rx-byte=1000"]);
    }

    #[tokio::test]
    async fn two_byte_length_supported() {
        let long_word = "x".repeat(0x200);
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_sentence(&mut client, &[&long_word]).await.unwrap();
        let words = read_sentence(&mut server).await.unwrap();
        assert_eq!(words[0].len(), 0x200);
    }
}
