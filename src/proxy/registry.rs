use mio::Token;
use std::collections::HashMap;

/// 连接 ID，按接入顺序递增，进程内不复用
pub type ConnId = u64;

/// 连接的哪一端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Backend,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Backend => write!(f, "backend"),
        }
    }
}

/// 单调递增的 token 分配器，token 在进程生命周期内不复用
#[derive(Debug)]
pub struct TokenAllocator {
    next: usize,
}

impl TokenAllocator {
    pub fn new(first: usize) -> Self {
        Self { next: first }
    }

    pub fn next(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        token
    }
}

struct Entry<C> {
    conn: C,
    client: Token,
    backend: Option<Token>,
}

/// 连接注册表
///
/// 唯一拥有所有存活连接（`id -> 连接`），另维护 `token -> (id, 端)` 索引，
/// 两端 token 都能 O(1) 找到同一个连接。移除时两个索引项一起删除。
pub struct ConnectionRegistry<C> {
    connections: HashMap<ConnId, Entry<C>>,
    index: HashMap<Token, (ConnId, Side)>,
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            index: HashMap::new(),
        }
    }

    /// 登记新接入的连接
    pub fn insert(&mut self, id: ConnId, client: Token, conn: C) {
        debug_assert!(!self.connections.contains_key(&id));
        self.index.insert(client, (id, Side::Client));
        self.connections.insert(
            id,
            Entry {
                conn,
                client,
                backend: None,
            },
        );
    }

    /// 登记后端 token；重复登记同一个 token 无副作用
    pub fn bind_backend(&mut self, id: ConnId, token: Token) -> bool {
        let Some(entry) = self.connections.get_mut(&id) else {
            return false;
        };
        match entry.backend {
            Some(existing) if existing == token => true,
            Some(_) => false,
            None => {
                entry.backend = Some(token);
                self.index.insert(token, (id, Side::Backend));
                true
            }
        }
    }

    /// 根据 token 查找连接及对应端
    pub fn lookup(&self, token: Token) -> Option<(ConnId, Side)> {
        self.index.get(&token).copied()
    }

    pub fn get(&self, id: ConnId) -> Option<&C> {
        self.connections.get(&id).map(|entry| &entry.conn)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut C> {
        self.connections.get_mut(&id).map(|entry| &mut entry.conn)
    }

    /// 移除连接及其全部 token 索引
    pub fn remove(&mut self, id: ConnId) -> Option<C> {
        let entry = self.connections.remove(&id)?;
        self.index.remove(&entry.client);
        if let Some(backend) = entry.backend {
            self.index.remove(&backend);
        }
        Some(entry.conn)
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &C)> {
        self.connections.iter().map(|(id, entry)| (*id, &entry.conn))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocator_never_reuses() {
        let mut tokens = TokenAllocator::new(2);
        assert_eq!(tokens.next(), Token(2));
        assert_eq!(tokens.next(), Token(3));
        assert_eq!(tokens.next(), Token(4));
    }

    #[test]
    fn test_both_tokens_resolve_to_same_connection() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(7, Token(10), "conn-7");
        assert_eq!(registry.lookup(Token(10)), Some((7, Side::Client)));
        assert_eq!(registry.lookup(Token(11)), None);

        assert!(registry.bind_backend(7, Token(11)));
        assert!(registry.bind_backend(7, Token(11)));
        assert!(!registry.bind_backend(7, Token(12)));
        assert_eq!(registry.lookup(Token(11)), Some((7, Side::Backend)));
        assert_eq!(registry.lookup(Token(12)), None);

        let (client_id, _) = registry.lookup(Token(10)).unwrap();
        let (backend_id, _) = registry.lookup(Token(11)).unwrap();
        assert_eq!(client_id, backend_id);
        assert_eq!(registry.get(client_id), Some(&"conn-7"));
    }

    #[test]
    fn test_removed_connection_is_unreachable() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(1, Token(2), String::from("a"));
        registry.insert(2, Token(3), String::from("b"));
        registry.bind_backend(1, Token(4));

        assert_eq!(registry.remove(1).as_deref(), Some("a"));
        assert_eq!(registry.lookup(Token(2)), None);
        assert_eq!(registry.lookup(Token(4)), None);
        assert!(registry.get_mut(1).is_none());
        assert!(registry.remove(1).is_none());
        assert!(!registry.bind_backend(1, Token(5)));

        // 其他连接不受影响
        assert_eq!(registry.lookup(Token(3)), Some((2, Side::Client)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec![2]);
    }

    #[test]
    fn test_remove_without_backend() {
        let mut registry: ConnectionRegistry<u32> = ConnectionRegistry::default();
        assert!(registry.is_empty());
        registry.insert(3, Token(9), 42);
        if let Some(conn) = registry.get_mut(3) {
            *conn += 1;
        }
        assert_eq!(registry.iter().collect::<Vec<_>>(), vec![(3, &43)]);
        assert_eq!(registry.remove(3), Some(43));
        assert!(registry.is_empty());
    }
}
