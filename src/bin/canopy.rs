use canopy::command::Error;


#[tokio::main]
async fn main() -> Result<(), Error> {
    canopy::command::run().await
}
