use std::sync::Arc;

use async_trait::async_trait;
use mash_net::{Action, Connection, Listener, ListenerFactory, Message, Server, Session};
use tokio::net::TcpStream;

struct InfoListener;

#[async_trait]
impl Listener for InfoListener {
    async fn handle_command(&mut self, session: &mut Session, command: &Message) -> Action {
        match command.name.as_str() {
            "INFO" => {
                let _ = session
                    .send_response(&Message::new("TYPE").arg("TestServer"))
                    .await;
                let _ = session
                    .send_response(&Message::new("PROTOCOL").arg("1.0"))
                    .await;
                Action::None
            }
            "STATUS" => {
                let _ = session.send_response(&Message::new("READY")).await;
                Action::None
            }
            "DONE" => {
                let _ = session.send_response(&Message::new("GOODBYE")).await;
                Action::CloseConnection
            }
            _ => {
                let _ = session.send_response(&Message::new("UNKNOWN_COMMAND")).await;
                Action::None
            }
        }
    }
}

async fn connect(port: u16) -> Connection<TcpStream> {
    Connection::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap())
}

async fn ask(conn: &mut Connection<TcpStream>, command: &str) -> Option<Message> {
    conn.send_message(&Message::decode(command)).await.unwrap();
    conn.wait_message().await.unwrap()
}

#[tokio::test]
async fn second_client_is_busy_when_limited_to_one() {
    let mut server = Server::new("TestServer", 1);
    let port = server.listen("127.0.0.1", 0).unwrap().port();
    let stop = server.stop_token();
    let factory: ListenerFactory = Arc::new(|| Box::new(InfoListener) as Box<dyn Listener>);
    let running = tokio::spawn(async move { server.run(factory).await });

    let mut first = connect(port).await;
    assert_eq!(ask(&mut first, "STATUS").await, Some(Message::new("READY")));

    let mut second = connect(port).await;
    let info = ask(&mut second, "INFO").await.unwrap();
    assert_eq!(info, Message::new("TYPE").arg("TestServer"));
    assert_eq!(
        second.wait_message().await.unwrap(),
        Some(Message::new("PROTOCOL").arg("1.0"))
    );

    assert_eq!(ask(&mut second, "STATUS").await, Some(Message::new("BUSY")));
    assert_eq!(second.wait_message().await.unwrap(), None);

    // The first client is unaffected.
    assert_eq!(ask(&mut first, "STATUS").await, Some(Message::new("READY")));
    assert_eq!(ask(&mut first, "DONE").await, Some(Message::new("GOODBYE")));

    stop.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn unlimited_server_serves_everyone() {
    let mut server = Server::new("TestServer", 0);
    let port = server.listen("127.0.0.1", 0).unwrap().port();
    let stop = server.stop_token();
    let factory: ListenerFactory = Arc::new(|| Box::new(InfoListener) as Box<dyn Listener>);
    let running = tokio::spawn(async move { server.run(factory).await });

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = connect(port).await;
        assert_eq!(ask(&mut client, "STATUS").await, Some(Message::new("READY")));
        clients.push(client);
    }

    stop.cancel();
    running.await.unwrap().unwrap();

    // Handlers were interrupted: every client sees the end of the stream.
    for mut client in clients {
        assert_eq!(client.wait_message().await.unwrap(), None);
    }
}
