//! Connection-core command surface and the dispatch seam.
//!
//! Only the commands that manipulate connection state live here; everything else belongs to
//! the external command dispatcher this module's trait abstracts over.

use std::sync::Arc;
use std::time::Duration;

use orca_common::ids::ClientId;
use orca_protocol::ProtocolVersion;
use orca_protocol::reply::AggregateKind;

use crate::app::{ServerShared, on_owner_thread};
use crate::client::{Client, ClientState, ClientTypeFilter, ReplyMode};
use crate::lifecycle::{free_client_async, free_client_async_locked, free_client_with_registry};
use crate::registry::ClientRegistry;
use crate::scheduler::{
    add_reply_aggregate_header, add_reply_bulk, add_reply_error, add_reply_integer,
    add_reply_null, add_reply_status, patch_deferred_reply, reserve_deferred_reply,
};

/// Execution context handed to the dispatcher for one parsed command.
///
/// The registry lock and the issuing client's guard are both held for the duration of the
/// dispatch, so command code may inspect and mutate other clients in a consistent order.
pub struct CommandContext<'a> {
    pub shared: &'a Arc<ServerShared>,
    pub registry: &'a mut ClientRegistry,
    pub client: &'a Arc<Client>,
    pub state: &'a mut ClientState,
}

/// Seam between the connection core and command business logic.
///
/// The argument vector is owned by the issuing client until dispatch, then moved here.
pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, ctx: &mut CommandContext<'_>, args: Vec<Vec<u8>>);
}

/// Built-in dispatcher covering the connection-management commands.
pub struct ConnectionCommands;

impl CommandDispatcher for ConnectionCommands {
    fn dispatch(&self, ctx: &mut CommandContext<'_>, args: Vec<Vec<u8>>) {
        let Some(name) = args.first() else {
            return;
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        match name.as_str() {
            "PING" => ping_command(ctx, &args),
            "ECHO" => echo_command(ctx, &args),
            "CLIENT" => client_command(ctx, &args),
            "HELLO" => hello_command(ctx, &args),
            // Cross-protocol scripting guard: an HTTP verb or header arriving as an inline
            // command means someone is smuggling HTTP at us; drop the connection.
            "POST" | "HOST:" => {
                tracing::warn!(
                    client = ctx.client.id(),
                    "possible cross-protocol scripting attack, closing connection"
                );
                free_client_async_locked(ctx.shared, ctx.client, ctx.state);
            }
            _ => {
                let printable = name
                    .chars()
                    .map(|c| if c.is_ascii_graphic() { c } else { '.' })
                    .collect::<String>();
                add_reply_error(
                    ctx.shared,
                    ctx.client,
                    ctx.state,
                    &format!("unknown command '{printable}'"),
                );
            }
        }
    }
}

fn wrong_arity(ctx: &mut CommandContext<'_>, command: &str) {
    add_reply_error(
        ctx.shared,
        ctx.client,
        ctx.state,
        &format!("wrong number of arguments for '{command}' command"),
    );
}

fn syntax_error(ctx: &mut CommandContext<'_>) {
    add_reply_error(ctx.shared, ctx.client, ctx.state, "syntax error");
}

fn parse_integer_arg(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse::<i64>().ok()
}

fn ping_command(ctx: &mut CommandContext<'_>, args: &[Vec<u8>]) {
    match args.len() {
        1 => add_reply_status(ctx.shared, ctx.client, ctx.state, "PONG"),
        2 => add_reply_bulk(ctx.shared, ctx.client, ctx.state, &args[1]),
        _ => wrong_arity(ctx, "ping"),
    }
}

fn echo_command(ctx: &mut CommandContext<'_>, args: &[Vec<u8>]) {
    if args.len() != 2 {
        wrong_arity(ctx, "echo");
        return;
    }
    add_reply_bulk(ctx.shared, ctx.client, ctx.state, &args[1]);
}

/// `CLIENT SETNAME` charset rule: printable ASCII with no spaces, so `CLIENT LIST` output
/// stays splittable on whitespace. An empty name unsets the current one.
fn set_name_or_reply(ctx: &mut CommandContext<'_>, name: &[u8]) -> bool {
    if name.is_empty() {
        ctx.state.name.clear();
        return true;
    }
    if !name.iter().all(|byte| (b'!'..=b'~').contains(byte)) {
        add_reply_error(
            ctx.shared,
            ctx.client,
            ctx.state,
            "Client names cannot contain spaces, newlines or special characters.",
        );
        return false;
    }
    ctx.state.name = String::from_utf8_lossy(name).into_owned();
    true
}

fn client_command(ctx: &mut CommandContext<'_>, args: &[Vec<u8>]) {
    let Some(subcommand) = args.get(1) else {
        wrong_arity(ctx, "client");
        return;
    };
    let subcommand = String::from_utf8_lossy(subcommand).to_ascii_uppercase();
    match subcommand.as_str() {
        "HELP" if args.len() == 2 => client_help(ctx),
        "ID" if args.len() == 2 => {
            let id = i64::try_from(ctx.client.id()).unwrap_or(i64::MAX);
            add_reply_integer(ctx.shared, ctx.client, ctx.state, id);
        }
        "GETNAME" if args.len() == 2 => {
            if ctx.state.name.is_empty() {
                add_reply_null(ctx.shared, ctx.client, ctx.state);
            } else {
                let name = ctx.state.name.clone();
                add_reply_bulk(ctx.shared, ctx.client, ctx.state, name.as_bytes());
            }
        }
        "SETNAME" if args.len() == 3 => {
            if set_name_or_reply(ctx, &args[2]) {
                add_reply_status(ctx.shared, ctx.client, ctx.state, "OK");
            }
        }
        "LIST" => client_list(ctx, args),
        "REPLY" if args.len() == 3 => client_reply(ctx, &args[2]),
        "KILL" => client_kill(ctx, args),
        "PAUSE" if args.len() == 3 => {
            let Some(timeout_ms) = parse_integer_arg(&args[2]).filter(|ms| *ms >= 0) else {
                add_reply_error(
                    ctx.shared,
                    ctx.client,
                    ctx.state,
                    "timeout is not an integer or out of range",
                );
                return;
            };
            ctx.shared
                .pause_clients(Duration::from_millis(timeout_ms.unsigned_abs()));
            add_reply_status(ctx.shared, ctx.client, ctx.state, "OK");
        }
        "UNPAUSE" if args.len() == 2 => {
            ctx.shared.unpause_clients();
            add_reply_status(ctx.shared, ctx.client, ctx.state, "OK");
        }
        _ => {
            let printable = subcommand
                .chars()
                .map(|c| if c.is_ascii_graphic() { c } else { '.' })
                .collect::<String>();
            add_reply_error(
                ctx.shared,
                ctx.client,
                ctx.state,
                &format!(
                    "Unknown subcommand or wrong number of arguments for '{printable}'. \
                     Try CLIENT HELP."
                ),
            );
        }
    }
}

fn client_help(ctx: &mut CommandContext<'_>) {
    const HELP: &[&str] = &[
        "id                     -- Return the ID of the current connection.",
        "getname                -- Return the name of the current connection.",
        "setname <name>         -- Assign the name <name> to the current connection.",
        "list [type (normal|replica|pubsub|master)] -- Return information about client connections.",
        "kill <ip:port>         -- Kill connection made from <ip:port>.",
        "kill <option> <value> [option value ...] -- Kill connections. Options: id, addr, type, skipme.",
        "reply (on|off|skip)    -- Control the replies sent to the current connection.",
        "pause <timeout>        -- Suspend all clients for <timeout> milliseconds.",
        "unpause                -- Resume processing of paused clients.",
    ];
    // The line count is patched in afterwards; this is the standard shape for replies whose
    // cardinality is only known once the elements are out.
    let node = reserve_deferred_reply(ctx.shared, ctx.client, ctx.state);
    add_reply_status(
        ctx.shared,
        ctx.client,
        ctx.state,
        "CLIENT <subcommand> arg arg ... arg. Subcommands are:",
    );
    for line in HELP {
        add_reply_status(ctx.shared, ctx.client, ctx.state, line);
    }
    let count = i64::try_from(HELP.len() + 1).unwrap_or(i64::MAX);
    patch_deferred_reply(
        ctx.shared,
        ctx.client,
        ctx.state,
        node,
        AggregateKind::Array,
        count,
    );
}

fn client_list(ctx: &mut CommandContext<'_>, args: &[Vec<u8>]) {
    let type_filter = match args.len() {
        2 => None,
        4 if args[2].eq_ignore_ascii_case(b"type") => {
            let name = String::from_utf8_lossy(&args[3]).into_owned();
            match ClientTypeFilter::from_name(&name) {
                Some(filter) => Some(filter),
                None => {
                    add_reply_error(
                        ctx.shared,
                        ctx.client,
                        ctx.state,
                        &format!("Unknown client type '{name}'"),
                    );
                    return;
                }
            }
        }
        _ => {
            syntax_error(ctx);
            return;
        }
    };

    let mut listing = String::new();
    for other in ctx.registry.snapshot_ordered() {
        let line = if other.id() == ctx.client.id() {
            if type_filter.is_some_and(|filter| filter != Client::type_of(ctx.state)) {
                continue;
            }
            other.info_line(ctx.state)
        } else {
            let other_state = other.state.lock();
            if type_filter.is_some_and(|filter| filter != Client::type_of(&other_state)) {
                continue;
            }
            other.info_line(&other_state)
        };
        listing.push_str(&line);
        listing.push('\n');
    }
    add_reply_bulk(ctx.shared, ctx.client, ctx.state, listing.as_bytes());
}

fn client_reply(ctx: &mut CommandContext<'_>, mode: &[u8]) {
    if mode.eq_ignore_ascii_case(b"on") {
        ctx.state.reply_mode = ReplyMode::On;
        add_reply_status(ctx.shared, ctx.client, ctx.state, "OK");
    } else if mode.eq_ignore_ascii_case(b"off") {
        ctx.state.reply_mode = ReplyMode::Off;
    } else if mode.eq_ignore_ascii_case(b"skip") {
        // OFF is sticky; SKIP only arms suppression for the next command.
        if ctx.state.reply_mode != ReplyMode::Off {
            ctx.state.reply_mode = ReplyMode::SkipNext;
        }
    } else {
        syntax_error(ctx);
    }
}

#[derive(Default)]
struct KillFilter {
    addr: Option<String>,
    id: Option<ClientId>,
    type_filter: Option<ClientTypeFilter>,
    skipme: bool,
    old_style: bool,
}

fn client_kill(ctx: &mut CommandContext<'_>, args: &[Vec<u8>]) {
    let mut filter = KillFilter {
        skipme: true,
        ..KillFilter::default()
    };

    if args.len() == 3 {
        // Old style: CLIENT KILL <addr>. You are allowed to kill yourself.
        filter.addr = Some(String::from_utf8_lossy(&args[2]).into_owned());
        filter.skipme = false;
        filter.old_style = true;
    } else if args.len() > 3 {
        let mut index = 2;
        while index < args.len() {
            let Some(value) = args.get(index + 1) else {
                syntax_error(ctx);
                return;
            };
            let option = &args[index];
            if option.eq_ignore_ascii_case(b"id") {
                let Some(id) = parse_integer_arg(value).filter(|id| *id > 0) else {
                    add_reply_error(
                        ctx.shared,
                        ctx.client,
                        ctx.state,
                        "client-id should be greater than 0",
                    );
                    return;
                };
                filter.id = Some(id.unsigned_abs());
            } else if option.eq_ignore_ascii_case(b"addr") {
                filter.addr = Some(String::from_utf8_lossy(value).into_owned());
            } else if option.eq_ignore_ascii_case(b"type") {
                let name = String::from_utf8_lossy(value).into_owned();
                let Some(type_filter) = ClientTypeFilter::from_name(&name) else {
                    add_reply_error(
                        ctx.shared,
                        ctx.client,
                        ctx.state,
                        &format!("Unknown client type '{name}'"),
                    );
                    return;
                };
                filter.type_filter = Some(type_filter);
            } else if option.eq_ignore_ascii_case(b"skipme") {
                if value.eq_ignore_ascii_case(b"yes") {
                    filter.skipme = true;
                } else if value.eq_ignore_ascii_case(b"no") {
                    filter.skipme = false;
                } else {
                    syntax_error(ctx);
                    return;
                }
            } else {
                syntax_error(ctx);
                return;
            }
            index += 2;
        }
    } else {
        syntax_error(ctx);
        return;
    }

    let mut victims = Vec::new();
    let mut close_this_client = false;
    for candidate in ctx.registry.snapshot_ordered() {
        let is_self = candidate.id() == ctx.client.id();
        let matches = if is_self {
            kill_filter_matches(&filter, &candidate, ctx.state)
        } else {
            let candidate_state = candidate.state.lock();
            kill_filter_matches(&filter, &candidate, &candidate_state)
        };
        if !matches {
            continue;
        }
        if is_self {
            if filter.skipme {
                continue;
            }
            close_this_client = true;
        } else {
            victims.push(candidate);
        }
    }

    let mut killed = usize::from(close_this_client);
    for victim in victims {
        if on_owner_thread(&victim) {
            let _ = free_client_with_registry(ctx.shared, ctx.registry, &victim);
        } else {
            free_client_async(ctx.shared, &victim);
        }
        killed += 1;
    }

    if filter.old_style {
        if killed == 0 {
            add_reply_error(ctx.shared, ctx.client, ctx.state, "No such client");
        } else {
            add_reply_status(ctx.shared, ctx.client, ctx.state, "OK");
        }
    } else {
        let killed = i64::try_from(killed).unwrap_or(i64::MAX);
        add_reply_integer(ctx.shared, ctx.client, ctx.state, killed);
    }

    // Flag only after the reply is queued, so the victim sees its own confirmation.
    if close_this_client {
        ctx.state.close_after_reply = true;
    }
}

fn kill_filter_matches(filter: &KillFilter, candidate: &Arc<Client>, state: &ClientState) -> bool {
    if let Some(addr) = &filter.addr {
        if Client::peer_id(state) != *addr {
            return false;
        }
    }
    if let Some(type_filter) = filter.type_filter {
        if Client::type_of(state) != type_filter {
            return false;
        }
    }
    if let Some(id) = filter.id {
        if candidate.id() != id {
            return false;
        }
    }
    true
}

/// `HELLO [<protover> [SETNAME <name>]]`: protocol negotiation plus a map of server
/// identity fields, encoded in the newly selected version.
fn hello_command(ctx: &mut CommandContext<'_>, args: &[Vec<u8>]) {
    let mut version = ctx.state.version;
    if let Some(requested) = args.get(1) {
        let Some(negotiated) =
            parse_integer_arg(requested).and_then(ProtocolVersion::from_number)
        else {
            add_reply_error(
                ctx.shared,
                ctx.client,
                ctx.state,
                "-NOPROTO unsupported protocol version",
            );
            return;
        };
        version = negotiated;
    }

    let mut index = 2;
    while index < args.len() {
        let option = &args[index];
        if option.eq_ignore_ascii_case(b"setname") && index + 1 < args.len() {
            if !set_name_or_reply(ctx, &args[index + 1]) {
                return;
            }
            index += 2;
        } else if option.eq_ignore_ascii_case(b"auth") {
            add_reply_error(
                ctx.shared,
                ctx.client,
                ctx.state,
                "authentication is not enabled on this server",
            );
            return;
        } else {
            let printable = String::from_utf8_lossy(option).into_owned();
            add_reply_error(
                ctx.shared,
                ctx.client,
                ctx.state,
                &format!("Syntax error in HELLO option '{printable}'"),
            );
            return;
        }
    }

    ctx.state.version = version;
    add_reply_aggregate_header(ctx.shared, ctx.client, ctx.state, AggregateKind::Map, 7);

    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"server");
    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"orca");

    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"version");
    add_reply_bulk(
        ctx.shared,
        ctx.client,
        ctx.state,
        env!("CARGO_PKG_VERSION").as_bytes(),
    );

    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"proto");
    add_reply_integer(ctx.shared, ctx.client, ctx.state, version.as_number());

    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"id");
    let id = i64::try_from(ctx.client.id()).unwrap_or(i64::MAX);
    add_reply_integer(ctx.shared, ctx.client, ctx.state, id);

    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"mode");
    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"standalone");

    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"role");
    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"master");

    add_reply_bulk(ctx.shared, ctx.client, ctx.state, b"modules");
    add_reply_aggregate_header(ctx.shared, ctx.client, ctx.state, AggregateKind::Array, 0);
}

#[cfg(test)]
mod tests {
    use super::{CommandContext, CommandDispatcher, ConnectionCommands};
    use crate::app::{ServerShared, set_current_worker};
    use crate::lifecycle::create_detached_client;
    use crate::testkit;
    use googletest::prelude::*;
    use orca_common::config::RuntimeConfig;
    use orca_protocol::ProtocolVersion;
    use rstest::rstest;
    use std::sync::Arc;

    fn shared() -> Arc<ServerShared> {
        Arc::new(ServerShared::new(
            RuntimeConfig::default(),
            Box::new(ConnectionCommands),
        ))
    }

    fn run_command(shared: &Arc<ServerShared>, client: &Arc<crate::client::Client>, parts: &[&[u8]]) {
        let args = parts.iter().map(|part| part.to_vec()).collect::<Vec<_>>();
        let mut registry = shared.registry.lock();
        let mut state = client.state.lock();
        let mut ctx = CommandContext {
            shared,
            registry: &mut registry,
            client,
            state: &mut state,
        };
        ConnectionCommands.dispatch(&mut ctx, args);
    }

    fn drain_replies(client: &Arc<crate::client::Client>) -> Vec<u8> {
        let mut state = client.state.lock();
        let bytes = state.reply.queued_bytes();
        state.reply.clear();
        bytes
    }

    #[rstest]
    fn ping_and_echo_round_trip() {
        let shared = shared();
        let client = create_detached_client(&shared);
        run_command(&shared, &client, &[b"PING"]);
        assert_that!(&drain_replies(&client), eq(&b"+PONG\r\n".to_vec()));

        run_command(&shared, &client, &[b"ping", b"hello"]);
        assert_that!(&drain_replies(&client), eq(&b"$5\r\nhello\r\n".to_vec()));

        run_command(&shared, &client, &[b"ECHO", b"payload"]);
        assert_that!(&drain_replies(&client), eq(&b"$7\r\npayload\r\n".to_vec()));
    }

    #[rstest]
    fn unknown_commands_report_an_error() {
        let shared = shared();
        let client = create_detached_client(&shared);
        run_command(&shared, &client, &[b"NOSUCHCMD"]);
        assert_that!(
            &drain_replies(&client),
            eq(&b"-ERR unknown command 'NOSUCHCMD'\r\n".to_vec())
        );
    }

    #[rstest]
    fn client_id_and_name_round_trip() {
        let shared = shared();
        let client = create_detached_client(&shared);
        run_command(&shared, &client, &[b"CLIENT", b"ID"]);
        assert_that!(
            &drain_replies(&client),
            eq(&format!(":{}\r\n", client.id()).into_bytes())
        );

        // Unnamed: RESP2 null bulk.
        run_command(&shared, &client, &[b"CLIENT", b"GETNAME"]);
        assert_that!(&drain_replies(&client), eq(&b"$-1\r\n".to_vec()));

        run_command(&shared, &client, &[b"CLIENT", b"SETNAME", b"with space"]);
        let reply = drain_replies(&client);
        assert_that!(reply.starts_with(b"-ERR Client names"), eq(true));

        run_command(&shared, &client, &[b"CLIENT", b"SETNAME", b"worker-1"]);
        assert_that!(&drain_replies(&client), eq(&b"+OK\r\n".to_vec()));

        run_command(&shared, &client, &[b"CLIENT", b"GETNAME"]);
        assert_that!(&drain_replies(&client), eq(&b"$8\r\nworker-1\r\n".to_vec()));
    }

    #[rstest]
    fn hello_negotiates_protocol_and_changes_null_encoding() {
        let shared = shared();
        let client = create_detached_client(&shared);

        run_command(&shared, &client, &[b"HELLO", b"3"]);
        let reply = drain_replies(&client);
        assert_that!(reply.starts_with(b"%7\r\n"), eq(true));
        assert_that!(client.state.lock().version, eq(ProtocolVersion::Resp3));

        // Null replies now use the RESP3 encoding.
        run_command(&shared, &client, &[b"CLIENT", b"GETNAME"]);
        assert_that!(&drain_replies(&client), eq(&b"_\r\n".to_vec()));

        run_command(&shared, &client, &[b"HELLO", b"2"]);
        let reply = drain_replies(&client);
        assert_that!(reply.starts_with(b"*14\r\n"), eq(true));
        run_command(&shared, &client, &[b"CLIENT", b"GETNAME"]);
        assert_that!(&drain_replies(&client), eq(&b"$-1\r\n".to_vec()));
    }

    #[rstest]
    fn hello_rejects_unsupported_versions() {
        let shared = shared();
        let client = create_detached_client(&shared);
        run_command(&shared, &client, &[b"HELLO", b"4"]);
        assert_that!(
            &drain_replies(&client),
            eq(&b"-NOPROTO unsupported protocol version\r\n".to_vec())
        );
        assert_that!(client.state.lock().version, eq(ProtocolVersion::Resp2));
    }

    #[rstest]
    fn client_reply_skip_suppresses_exactly_one_reply() {
        let shared = shared();
        let client = create_detached_client(&shared);

        run_command(&shared, &client, &[b"CLIENT", b"REPLY", b"SKIP"]);
        assert_that!(drain_replies(&client).is_empty(), eq(true));
        // Simulate the post-command mode transition the ingress loop performs.
        testkit::advance_reply_mode(&client);

        run_command(&shared, &client, &[b"PING"]);
        assert_that!(drain_replies(&client).is_empty(), eq(true));
        testkit::advance_reply_mode(&client);

        run_command(&shared, &client, &[b"PING"]);
        assert_that!(&drain_replies(&client), eq(&b"+PONG\r\n".to_vec()));
    }

    #[rstest]
    fn client_list_reports_linked_clients() {
        let shared = shared();
        set_current_worker(Some(0));
        let (connected, _peer) = testkit::connected_client(&shared, 0);
        let issuer = create_detached_client(&shared);

        run_command(&shared, &issuer, &[b"CLIENT", b"LIST"]);
        let reply = drain_replies(&issuer);
        let text = String::from_utf8_lossy(&reply);
        assert_that!(text.contains(&format!("id={}", connected.id())), eq(true));
        assert_that!(text.contains("flags=N"), eq(true));

        run_command(&shared, &issuer, &[b"CLIENT", b"LIST", b"TYPE", b"replica"]);
        let reply = drain_replies(&issuer);
        // Header + empty body: no replicas are connected.
        assert_that!(&reply[..4], eq(b"$0\r\n".as_slice()));
        set_current_worker(None);
    }

    #[rstest]
    fn client_kill_by_id_defers_other_thread_victims() {
        let shared = shared();
        set_current_worker(Some(0));
        let (victim, _peer) = testkit::connected_client(&shared, 1);
        let issuer = create_detached_client(&shared);

        let id = victim.id().to_string();
        run_command(
            &shared,
            &issuer,
            &[b"CLIENT", b"KILL", b"ID", id.as_bytes()],
        );
        assert_that!(&drain_replies(&issuer), eq(&b":1\r\n".to_vec()));
        // The victim is owned by worker 1, so destruction was deferred, not synchronous.
        assert_that!(victim.state.lock().close_asap, eq(true));
        assert_that!(shared.registry.lock().lookup(victim.id()).is_some(), eq(true));
        set_current_worker(None);
    }

    #[rstest]
    fn client_kill_same_thread_victim_is_destroyed_synchronously() {
        let shared = shared();
        set_current_worker(Some(0));
        let (victim, _peer) = testkit::connected_client(&shared, 0);
        let issuer = create_detached_client(&shared);

        let id = victim.id().to_string();
        run_command(
            &shared,
            &issuer,
            &[b"CLIENT", b"KILL", b"ID", id.as_bytes()],
        );
        assert_that!(&drain_replies(&issuer), eq(&b":1\r\n".to_vec()));
        assert_that!(shared.registry.lock().lookup(victim.id()).is_none(), eq(true));
        set_current_worker(None);
    }

    #[rstest]
    fn client_kill_old_style_reports_missing_peers() {
        let shared = shared();
        let issuer = create_detached_client(&shared);
        run_command(&shared, &issuer, &[b"CLIENT", b"KILL", b"10.0.0.1:4242"]);
        assert_that!(
            &drain_replies(&issuer),
            eq(&b"-ERR No such client\r\n".to_vec())
        );
    }

    #[rstest]
    fn client_help_emits_a_patched_array() {
        let shared = shared();
        let client = create_detached_client(&shared);
        run_command(&shared, &client, &[b"CLIENT", b"HELP"]);
        let reply = drain_replies(&client);
        assert_that!(reply.starts_with(b"*10\r\n+CLIENT <subcommand>"), eq(true));
    }

    #[rstest]
    fn client_pause_validates_its_timeout() {
        let shared = shared();
        let client = create_detached_client(&shared);
        run_command(&shared, &client, &[b"CLIENT", b"PAUSE", b"notanumber"]);
        assert_that!(
            &drain_replies(&client),
            eq(&b"-ERR timeout is not an integer or out of range\r\n".to_vec())
        );

        run_command(&shared, &client, &[b"CLIENT", b"PAUSE", b"60000"]);
        assert_that!(&drain_replies(&client), eq(&b"+OK\r\n".to_vec()));
        assert_that!(shared.clients_paused(), eq(true));

        run_command(&shared, &client, &[b"CLIENT", b"UNPAUSE"]);
        assert_that!(&drain_replies(&client), eq(&b"+OK\r\n".to_vec()));
        assert_that!(shared.clients_paused(), eq(false));
    }
}
