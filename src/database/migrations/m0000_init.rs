use super::{Migration, SimpleSqlMigration};

pub fn migration() -> impl Migration {
    SimpleSqlMigration {
        serial_number: 0,
        sql: vec![
            r#"
            CREATE TABLE users (
                id SERIAL PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                hashed_password BYTEA NOT NULL,
                balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
                created TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                deleted TIMESTAMP WITH TIME ZONE
            )"#,
            r#"CREATE INDEX user_email ON users (email)"#,
            r#"
            CREATE TABLE api_keys (
                id SERIAL PRIMARY KEY,
                user_id INT NOT NULL REFERENCES users,
                key_hash BYTEA NOT NULL,
                created TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )"#,
            r#"CREATE INDEX api_key_user ON api_keys (user_id)"#,
            // Invoices we issue (inbound) and invoices we pay (outbound).
            // Payment requests are stored upper-cased for match stability.
            r#"
            CREATE TABLE offchaintx (
                id SERIAL PRIMARY KEY,
                user_id INT NOT NULL REFERENCES users,
                payment_request TEXT NOT NULL,
                hashed_preimage TEXT NOT NULL,
                preimage TEXT,
                memo TEXT,
                description TEXT,
                callback_url TEXT,
                customer_order_id TEXT,
                expiry_sec BIGINT NOT NULL,
                amount_sat BIGINT NOT NULL,
                amount_msat BIGINT NOT NULL CHECK (amount_msat = amount_sat * 1000),
                direction TEXT NOT NULL CHECK (direction IN ('INBOUND', 'OUTBOUND')),
                status TEXT NOT NULL CHECK (status IN ('OPEN', 'SUCCEEDED', 'FAILED')),
                settled_at TIMESTAMP WITH TIME ZONE,
                created TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                deleted TIMESTAMP WITH TIME ZONE
            )"#,
            r#"CREATE INDEX offchaintx_payment_request ON offchaintx (payment_request)"#,
            r#"CREATE INDEX offchaintx_hashed_preimage ON offchaintx (hashed_preimage)"#,
            // On-chain deposits and withdrawals. A deposit row starts as a
            // bare issued address and gains its outpoint when the funding
            // transaction is observed.
            r#"
            CREATE TABLE transactions (
                id SERIAL PRIMARY KEY,
                user_id INT NOT NULL REFERENCES users,
                address TEXT NOT NULL,
                txid TEXT,
                vout INT,
                direction TEXT NOT NULL CHECK (direction IN ('INBOUND', 'OUTBOUND')),
                amount_sat BIGINT,
                description TEXT,
                confirmed BOOLEAN NOT NULL DEFAULT FALSE,
                confirmed_at TIMESTAMP WITH TIME ZONE,
                created TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                deleted TIMESTAMP WITH TIME ZONE,
                CHECK ((txid IS NULL) = (vout IS NULL))
            )"#,
            r#"CREATE INDEX transaction_address ON transactions (address)"#,
            r#"CREATE UNIQUE INDEX transaction_txid_vout ON transactions (txid, vout)"#,
        ],
    }
}
