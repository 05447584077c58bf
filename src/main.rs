#[tokio::main]
async fn main() -> anyhow::Result<()> {
    exercise_coach_lib::run().await
}
