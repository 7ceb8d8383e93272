// What the assistant can do, in the words it uses to explain itself.
// Shown verbatim when the user asks about the assistant instead of the game.

pub const CAPABILITIES: &str = r#"Potrafię przygotować dla wybranej postaci:
- /quest – pełny quest z etapami, NPC i nagrodą zgodną z ekonomią świata,
- /poboczny – krótszy quest poboczny,
- /hook – zaczepkę fabularną do podrzucenia w grze,
- /sekret, /przydomek i /npc – rozbudowę postaci,
- /frakcja i /porada – poradę dotyczącą miejsca postaci w świecie,
- /cechy – analizę cech, /relacje – analizę relacji,
- /streszczenie – streszczenie historii, /diagnoza – diagnozę problemu z wątkiem.
Postać wybierasz znacznikiem #odnośnik, np. /quest #lotka.
Możesz też po prostu opisać, czego potrzebujesz, a dopytam o szczegóły (najwyżej kilka pytań, potem generuję).
W treści używaj @imie, @gildia, @historia, @slabosci, @aspiracje, żeby odwołać się do pól karty postaci.
Dodatkowe wskazówki podajesz znacznikami: ton: ..., motyw: ..., bez-tonu: ..., bez-motywu: ....
Odpowiedź widać na żywo; rozumowanie modelu jest pokazywane osobno i nie trafia do wyniku."#;

/// Does the message ask about the assistant itself rather than the game?
pub fn is_capabilities_query(message: &str) -> bool {
    let lower = message.to_lowercase();
    let keywords = [
        "co potrafisz",
        "co umiesz",
        "w czym możesz pomóc",
        "w czym mozesz pomoc",
        "jakie masz komendy",
        "jakie komendy",
        "lista komend",
        "pomoc",
        "/pomoc",
        "jak działasz",
        "jak dzialasz",
        "kim jesteś",
        "kim jestes",
        "what can you do",
        "help",
    ];

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '/')
        .filter(|w| !w.is_empty())
        .collect();

    // Single words must match a whole word; phrases match anywhere.
    keywords.iter().any(|kw| {
        if kw.contains(' ') {
            lower.contains(kw)
        } else {
            words.contains(kw)
        }
    })
}
