use core::future::Future;
use core::time::Duration;

pub(crate) async fn timeout<T, Fut, E>(duration: Option<Duration>, future: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<tokio::time::error::Elapsed>,
{
    if let Some(duration) = duration {
        debug!(?duration, "With timeout");
        tokio::time::timeout(duration, future).await?
    } else {
        future.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed() {
        let result: anyhow::Result<()> = timeout(Some(Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn no_timeout() {
        let result: anyhow::Result<u8> = timeout(None, async { Ok(5) }).await;
        assert_eq!(5, result.ok().unwrap_or_default());
    }
}
